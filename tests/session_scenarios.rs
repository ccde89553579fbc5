use rand::rngs::StdRng;
use rand::SeedableRng;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use updown::audio::AudioCue;
use updown::config::TrainingConfig;
use updown::controller::{EndReason, SessionController};
use updown::devices::{Button, HardwareStatus, Relay, SensorId, StimulusMode};
use updown::fusion::Position;
use updown::session::{DifficultyLevel, SessionState};
use updown::sim::{SimEvent, SimWorld};

// Whole sessions against the simulated rig on a manual clock. The subject is
// compliant unless a test scripts otherwise; the start button is pressed at 1 s.

fn session(world: &SimWorld, cfg: TrainingConfig, seed: u64) -> SessionController {
    world.press(Duration::from_secs(1), Button::Extension);
    SessionController::new(cfg, world.rig(), StdRng::seed_from_u64(seed)).unwrap()
}

fn count(cues: &[AudioCue], cue: AudioCue) -> usize {
    cues.iter().filter(|c| **c == cue).count()
}

fn position_of(cues: &[AudioCue], cue: AudioCue) -> Option<usize> {
    cues.iter().position(|c| *c == cue)
}

fn first_cue_at(world: &SimWorld, cue: AudioCue, after: Duration) -> Option<Duration> {
    world.events().iter().find_map(|e| match e {
        SimEvent::Cue { at, cue: c } if *c == cue && *at >= after => Some(*at),
        _ => None,
    })
}

#[test]
fn compliant_subject_reaches_goal() {
    let world = SimWorld::new();
    let mut controller = session(&world, TrainingConfig::testing(), 11);
    let report = controller.run().unwrap();

    assert_eq!(report.reason, Some(EndReason::GoalAchieved));
    assert_eq!(report.state, SessionState::Finished);
    assert!(report.completed_secs >= report.goal_secs);
    assert_eq!(report.rounds_voided, 0);
    assert!(report.rounds_played >= 1 && report.rounds_played <= 3);

    let cues = world.cues();
    assert_eq!(cues.first(), Some(&AudioCue::SessionStarted));
    assert_eq!(cues.last(), Some(&AudioCue::TrainingEnded));
    assert_eq!(count(&cues, AudioCue::Violation), 0);
    assert!(world
        .stimuli()
        .iter()
        .all(|s| s.mode == StimulusMode::Vibrate));

    assert!(world.relay_on(Relay::DownBulb));
    assert!(world.relay_on(Relay::UpBulb));
    assert!(world.relay_on(Relay::Heater));
    assert!(!world.relay_on(Relay::Strobe));
    assert!(!world.ambient_on());
}

#[test]
fn done_plug_follows_the_end_delay_and_is_held() {
    let world = SimWorld::new();
    let mut controller = session(&world, TrainingConfig::testing(), 11);
    controller.run().unwrap();

    let ended = first_cue_at(&world, AudioCue::TrainingEnded, Duration::ZERO).unwrap();
    let plug_on = world
        .events()
        .iter()
        .find_map(|e| match e {
            SimEvent::Relay {
                at,
                relay: Relay::DonePlug,
                on: true,
            } => Some(*at),
            _ => None,
        })
        .unwrap();
    assert!(plug_on >= ended + Duration::from_secs(180));
    assert!(plug_on <= ended + Duration::from_secs(300));
    assert_eq!(world.now(), plug_on);
    assert!(world.relay_on(Relay::DonePlug));

    // Someone switches the plug off; the next refresh puts it back.
    controller.rig().switchboard.set(Relay::DonePlug, false);
    controller.rig().switchboard.set(Relay::UpBulb, false);
    controller.refresh_end_state();
    assert_eq!(world.now(), plug_on + Duration::from_secs(30));
    assert!(world.relay_on(Relay::DonePlug));
    assert!(world.relay_on(Relay::UpBulb));
}

#[test]
fn worker_dispatcher_drains_before_the_report() {
    let world = SimWorld::new();
    world.lapse_every(Duration::from_secs(45), Duration::from_secs(20));
    world.press(Duration::from_secs(1), Button::Extension);
    let rig = world
        .threaded_rig(Arc::new(HardwareStatus::new()))
        .unwrap();
    let mut controller =
        SessionController::new(TrainingConfig::testing(), rig, StdRng::seed_from_u64(9)).unwrap();
    let report = controller.run().unwrap();

    assert!(report.stimuli_dispatched > 0);
    assert_eq!(world.stimuli().len() as u64, report.stimuli_dispatched);
    assert!(world
        .stimuli()
        .iter()
        .any(|s| s.mode == StimulusMode::Shock));
}

#[test]
fn failed_round_offers_extension_in_preparation() {
    let world = SimWorld::new();
    let mut cfg = TrainingConfig::testing();
    cfg.levels.easy.violation_limit = 1;
    world.lapse(Duration::from_secs(40), Duration::from_secs(60));
    world.press_on_cue(AudioCue::ExtensionAvailable, Duration::from_secs(3), Button::Extension);
    world.press_on_cue(AudioCue::ExtensionGranted, Duration::from_secs(600), Button::Rapid);
    let mut controller = session(&world, cfg, 6);
    let report = controller.run().unwrap();

    let cues = world.cues();
    let failed = position_of(&cues, AudioCue::RoundFailed).unwrap();
    let available = position_of(&cues, AudioCue::ExtensionAvailable).unwrap();
    assert!(failed < available);
    assert_eq!(cues[available + 1], AudioCue::ExtensionGranted);
    assert_eq!(cues[available + 2], AudioCue::PositionDown);
    assert_eq!(count(&cues, AudioCue::ExtensionGranted), 1);

    // The preparation window is paused while the extension runs.
    let offered = first_cue_at(&world, AudioCue::ExtensionAvailable, Duration::ZERO).unwrap();
    let next_round = first_cue_at(&world, AudioCue::PositionDown, offered).unwrap();
    let gap = next_round - offered;
    assert!(gap >= Duration::from_secs(619), "{gap:?}");
    assert!(gap < Duration::from_secs(622), "{gap:?}");

    assert!(report.extension_used_secs >= 599 && report.extension_used_secs <= 601);
    assert_eq!(report.extension_requests, 1);
}

#[test]
fn preparation_extension_beyond_the_pool_plays_limit_cue() {
    let world = SimWorld::new();
    let mut cfg = TrainingConfig::testing();
    cfg.levels.easy.violation_limit = 1;
    cfg.extension.pool_secs = 30.0;
    world.lapse(Duration::from_secs(40), Duration::from_secs(60));
    world.press_on_cue(AudioCue::ExtensionAvailable, Duration::from_secs(3), Button::Extension);
    let mut controller = session(&world, cfg, 6);
    let report = controller.run().unwrap();

    let cues = world.cues();
    let available = position_of(&cues, AudioCue::ExtensionAvailable).unwrap();
    assert_eq!(cues[available + 1], AudioCue::ExtensionDeniedLimit);
    assert_eq!(count(&cues, AudioCue::ExtensionGranted), 0);
    assert_eq!(report.extension_requests, 1);
    assert_eq!(report.extension_used_secs, 0);

    // A denial does not stretch the window.
    let offered = first_cue_at(&world, AudioCue::ExtensionAvailable, Duration::ZERO).unwrap();
    let next_round = first_cue_at(&world, AudioCue::PositionDown, offered).unwrap();
    assert!(next_round - offered < Duration::from_secs(22));
}

#[test]
fn void_break_runs_ambient_then_returns_to_preparation() {
    let world = SimWorld::new();
    world.refuse(Position::Up);
    let cfg = TrainingConfig::testing();
    let void_break = Duration::from_secs_f64(cfg.void_break_secs);
    let mut controller = session(&world, cfg, 3);
    controller.run().unwrap();

    let voided = first_cue_at(&world, AudioCue::TenInRow, Duration::ZERO).unwrap();
    let ambient: Vec<(Duration, bool)> = world
        .events()
        .iter()
        .filter_map(|e| match e {
            SimEvent::Ambient { at, on } if *at >= voided => Some((*at, *on)),
            _ => None,
        })
        .collect();
    let (on_at, on) = ambient[0];
    let (off_at, off) = ambient[1];
    assert!(on && !off);
    assert!(on_at < voided + Duration::from_secs(1));
    assert!(off_at - on_at >= void_break);
    assert!(off_at - on_at < void_break + Duration::from_secs(2));

    let cues = world.cues();
    let ten = position_of(&cues, AudioCue::TenInRow).unwrap();
    assert_eq!(cues[ten + 1], AudioCue::RoundStarting);
    assert_eq!(count(&cues, AudioCue::RoundOver), 0);
}

#[test]
fn first_round_is_announced_at_easy() {
    let world = SimWorld::new();
    let mut controller = session(&world, TrainingConfig::testing(), 5);
    controller.run().unwrap();

    let cues = world.cues();
    let starting = position_of(&cues, AudioCue::RoundStarting).unwrap();
    assert_eq!(cues[starting + 1], AudioCue::LevelEasy);
    assert_eq!(cues[starting + 2], AudioCue::PositionDown);
}

#[test]
fn refusing_up_voids_every_round_until_deadline() {
    let world = SimWorld::new();
    world.refuse(Position::Up);
    let mut controller = session(&world, TrainingConfig::testing(), 3);
    let report = controller.run().unwrap();

    assert_eq!(report.reason, Some(EndReason::DeadlineReached));
    assert_eq!(report.completed_secs, 0);
    assert!(report.rounds_voided > 0);
    assert_eq!(report.rounds_played, report.rounds_voided);
    assert_eq!(report.level, DifficultyLevel::Easy);
    assert_eq!(report.cycles_completed, 0);

    let cues = world.cues();
    let voided = report.rounds_voided as usize;
    assert_eq!(count(&cues, AudioCue::TenInRow), voided);
    // The round cut short by the deadline may have announced without voiding.
    let announced = count(&cues, AudioCue::Violation);
    assert!(announced == voided || announced == voided + 1);
    assert_eq!(count(&cues, AudioCue::ExtensionAvailable), 0);

    let shocks = world
        .stimuli()
        .iter()
        .filter(|s| s.mode == StimulusMode::Shock)
        .count();
    assert!(shocks >= voided * 7);
    assert!(world.stimuli().iter().all(|s| s.intensity >= 30));
}

#[test]
fn drifting_subject_is_shocked_but_not_voided() {
    let world = SimWorld::new();
    world.lapse_every(Duration::from_secs(45), Duration::from_secs(20));
    let mut controller = session(&world, TrainingConfig::testing(), 9);
    let report = controller.run().unwrap();

    assert_eq!(report.rounds_voided, 0);
    assert!(report.completed_secs > 0);
    let cues = world.cues();
    assert!(count(&cues, AudioCue::Violation) > 0);
    assert_eq!(count(&cues, AudioCue::TenInRow), 0);
}

#[test]
fn both_sensors_lost_mid_round_recovers_into_preparation() {
    let world = SimWorld::new();
    for sensor in [SensorId::Primary, SensorId::Backup] {
        world.sensor_outage(sensor, Duration::from_secs(60), Duration::from_secs(90));
    }
    let mut controller = session(&world, TrainingConfig::testing(), 21);
    let report = controller.run().unwrap();

    assert_eq!(report.reason, Some(EndReason::GoalAchieved));
    let cues = world.cues();
    let lost = position_of(&cues, AudioCue::SensorIssue).unwrap();
    let resolved = position_of(&cues, AudioCue::SensorIssueResolved).unwrap();
    assert!(lost < resolved);
    assert_eq!(count(&cues, AudioCue::SensorIssue), 1);
    assert_eq!(cues[resolved + 1], AudioCue::RoundStarting);
}

#[test]
fn sensor_patience_exhaustion_ends_session() {
    let world = SimWorld::new();
    let forever = Duration::from_secs(100 * 3600);
    for sensor in [SensorId::Primary, SensorId::Backup] {
        world.sensor_outage(sensor, Duration::from_secs(60), forever);
    }
    let cfg = TrainingConfig::testing();
    let patience = cfg.loss_patience();
    let mut controller = session(&world, cfg, 2);
    let report = controller.run().unwrap();

    assert_eq!(report.reason, Some(EndReason::SensorTimeout));
    let cues = world.cues();
    let timeout = position_of(&cues, AudioCue::SensorTimeout).unwrap();
    assert_eq!(cues[timeout + 1], AudioCue::TrainingEnded);
    assert_eq!(count(&cues, AudioCue::SensorIssueResolved), 0);
    assert!(world.now() >= Duration::from_secs(60) + patience);
    assert!(world.now() < Duration::from_secs(60) + patience + Duration::from_secs(30));
}

#[test]
fn primary_outage_fails_over_silently() {
    let world = SimWorld::new();
    world.sensor_outage(
        SensorId::Primary,
        Duration::from_secs(30),
        Duration::from_secs(100 * 3600),
    );
    let mut controller = session(&world, TrainingConfig::testing(), 4);
    let report = controller.run().unwrap();

    assert_eq!(report.reason, Some(EndReason::GoalAchieved));
    assert_eq!(count(&world.cues(), AudioCue::SensorIssue), 0);
}

#[test]
fn deadline_ends_session_without_failing_the_round() {
    let world = SimWorld::new();
    let mut cfg = TrainingConfig::testing();
    cfg.session_hours = 60.0 / 3600.0;
    let mut controller = session(&world, cfg, 8);
    let report = controller.run().unwrap();

    assert_eq!(report.reason, Some(EndReason::DeadlineReached));
    assert_eq!(report.completed_secs, 0);
    assert_eq!(report.rounds_played, 0);
    assert_eq!(report.level, DifficultyLevel::Easy);
    assert_eq!(world.cues().last(), Some(&AudioCue::TrainingEnded));
}

#[test]
fn offline_strobe_does_not_stop_the_session() {
    let world = SimWorld::new();
    world.fail_relay(Relay::Strobe);
    let mut controller = session(&world, TrainingConfig::testing(), 13);
    let report = controller.run().unwrap();
    assert_eq!(report.reason, Some(EndReason::GoalAchieved));
    assert!(!world.relay_on(Relay::Strobe));
}

#[test]
fn panic_in_a_phase_latches_emergency() {
    let world = SimWorld::new();
    world.fault_on(AudioCue::RoundStarting);
    let mut controller = session(&world, TrainingConfig::testing(), 1);
    controller.wait_for_sensors().unwrap();

    let clock = world.clock();
    let mut state = controller.step();
    for _ in 0..500 {
        if state == SessionState::Emergency {
            break;
        }
        clock.advance(Duration::from_millis(20));
        state = controller.step();
    }
    assert_eq!(state, SessionState::Emergency);
    assert!(controller.is_critical());
    assert!(controller.failure().unwrap().contains("injected audio fault"));
    assert!(world.relay_on(Relay::DonePlug));
    assert!(world.relay_on(Relay::DownBulb));
    assert!(world.relay_on(Relay::UpBulb));

    // Sticky: later steps re-assert the fail-safe and never leave.
    let before = world.now();
    for _ in 0..3 {
        assert_eq!(controller.step(), SessionState::Emergency);
    }
    assert!(world.now() >= before + Duration::from_secs(15));
    assert!(world.relay_on(Relay::DonePlug));
}

#[test]
fn no_sensor_at_startup_refuses_to_start() {
    let world = SimWorld::new();
    let forever = Duration::from_secs(100 * 3600);
    world.sensor_outage(SensorId::Primary, Duration::ZERO, forever);
    world.sensor_outage(SensorId::Backup, Duration::ZERO, forever);
    let mut controller = session(&world, TrainingConfig::testing(), 1);
    assert!(controller.run().is_err());
    assert_eq!(controller.state(), SessionState::Waiting);
    assert!(!world.relay_on(Relay::DonePlug));
}

#[test]
fn panic_while_waiting_for_sensors_engages_fail_safe() {
    let world = SimWorld::new();
    world.fault_on_sensors();
    let mut controller = session(&world, TrainingConfig::testing(), 1);

    let result = catch_unwind(AssertUnwindSafe(|| controller.run()));
    assert!(result.is_err());
    assert!(world.relay_on(Relay::DonePlug));
    assert!(world.relay_on(Relay::DownBulb));
    assert!(world.relay_on(Relay::UpBulb));
}
