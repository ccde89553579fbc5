use rand::rngs::StdRng;
use rand::SeedableRng;
use std::time::Duration;

use updown::audio::AudioCue;
use updown::config::{SecondsRange, TrainingConfig};
use updown::devices::{Button, Relay};
use updown::extension::ExtensionPool;
use updown::rest::{run_extension, BreakController, BreakOutcome, ExtensionEnd};
use updown::sim::{SimEvent, SimWorld};

const LONG: Duration = Duration::from_secs(24 * 3600);

fn secs(s: u64) -> Duration {
    Duration::from_secs(s)
}

fn forty_second_break() -> TrainingConfig {
    let mut cfg = TrainingConfig::testing();
    cfg.break_duration = SecondsRange::new(40.0, 40.0);
    cfg
}

fn pool_for(cfg: &TrainingConfig) -> ExtensionPool {
    ExtensionPool::new(
        Duration::from_secs_f64(cfg.extension.pool_secs),
        Duration::from_secs_f64(cfg.extension.min_grantable_secs),
        Duration::from_secs_f64(cfg.extension.request_cooldown_secs),
    )
}

fn count(cues: &[AudioCue], cue: AudioCue) -> usize {
    cues.iter().filter(|c| **c == cue).count()
}

fn within(actual: Duration, expected: Duration, slack: Duration) -> bool {
    actual + slack >= expected && actual <= expected + slack
}

#[test]
fn granted_extension_ends_on_either_button() {
    let world = SimWorld::new();
    let cfg = forty_second_break();
    let mut pool = pool_for(&cfg);
    let mut rng = StdRng::seed_from_u64(1);
    world.press(secs(5), Button::Extension);
    world.press(secs(600), Button::Rapid);

    let rig = world.rig();
    let outcome = BreakController::new(&cfg, &rig, &mut pool, &mut rng, LONG).run(true);

    assert_eq!(outcome, BreakOutcome::Completed);
    assert!(within(pool.used(), secs(595), Duration::from_millis(500)));
    assert_eq!(pool.requests(), 1);
    assert!(!pool.is_active());

    let cues = world.cues();
    assert_eq!(
        cues[..3],
        [
            AudioCue::RoundOver,
            AudioCue::RoundPassed,
            AudioCue::ExtensionGranted
        ]
    );
    // Fan delay is at least 15 minutes, so it never came on.
    assert!(!world
        .events()
        .iter()
        .any(|e| matches!(e, SimEvent::Relay { relay: Relay::Fan, on: true, .. })));
    assert!(!world.ambient_on());
}

#[test]
fn long_extension_swaps_heater_for_fan() {
    let world = SimWorld::new();
    let cfg = TrainingConfig::testing();
    let mut pool = pool_for(&cfg);
    let mut rng = StdRng::seed_from_u64(4);
    let rig = world.rig();
    rig.switchboard.set(Relay::Heater, true);
    world.press(secs(2000), Button::Extension);

    let end = run_extension(&cfg, &rig, &mut pool, &mut rng, LONG);

    assert_eq!(end, ExtensionEnd::Released);
    assert!(within(pool.used(), secs(2000), Duration::from_millis(500)));

    let events = world.events();
    let fan_on = events
        .iter()
        .find_map(|e| match e {
            SimEvent::Relay {
                at,
                relay: Relay::Fan,
                on: true,
            } => Some(*at),
            _ => None,
        })
        .unwrap();
    assert!(fan_on >= secs(15 * 60) && fan_on <= secs(25 * 60) + secs(1));
    assert!(events.iter().any(|e| matches!(
        e,
        SimEvent::Relay { at, relay: Relay::Heater, on: false } if *at == fan_on
    )));
    assert!(!world.relay_on(Relay::Fan));
    assert!(world.relay_on(Relay::Heater));
}

#[test]
fn deadline_interrupts_extension_and_break() {
    let world = SimWorld::new();
    let cfg = forty_second_break();
    let mut pool = pool_for(&cfg);
    let mut rng = StdRng::seed_from_u64(2);
    world.press(secs(5), Button::Extension);

    let rig = world.rig();
    let outcome = BreakController::new(&cfg, &rig, &mut pool, &mut rng, secs(300)).run(false);

    assert_eq!(outcome, BreakOutcome::DeadlineReached);
    assert!(within(world.now(), secs(300), Duration::from_millis(200)));
    assert!(within(pool.used(), secs(295), Duration::from_millis(500)));
    assert_eq!(world.cues()[1], AudioCue::RoundFailed);
    assert!(!world.ambient_on());
}

#[test]
fn exhausted_pool_plays_limit_cue() {
    let world = SimWorld::new();
    let cfg = forty_second_break();
    let mut pool = ExtensionPool::new(secs(100), secs(60), secs(25));
    pool.begin(Duration::ZERO, LONG);
    pool.finish(secs(90));
    let mut rng = StdRng::seed_from_u64(3);
    world.press(secs(5), Button::Extension);

    let rig = world.rig();
    let outcome = BreakController::new(&cfg, &rig, &mut pool, &mut rng, LONG).run(true);

    assert_eq!(outcome, BreakOutcome::Completed);
    assert_eq!(pool.requests(), 1);
    assert_eq!(pool.used(), secs(90));
    let cues = world.cues();
    assert_eq!(count(&cues, AudioCue::ExtensionDeniedLimit), 1);
    assert_eq!(count(&cues, AudioCue::ExtensionGranted), 0);
}

#[test]
fn presses_during_cooldown_are_ignored() {
    let world = SimWorld::new();
    let mut cfg = forty_second_break();
    cfg.extension.approval_probability = 0.0;
    let mut pool = pool_for(&cfg);
    let mut rng = StdRng::seed_from_u64(5);
    for at in [5, 10, 31] {
        world.press(secs(at), Button::Extension);
    }

    let rig = world.rig();
    let outcome = BreakController::new(&cfg, &rig, &mut pool, &mut rng, LONG).run(true);

    assert_eq!(outcome, BreakOutcome::Completed);
    assert_eq!(pool.requests(), 2);
    assert_eq!(count(&world.cues(), AudioCue::ExtensionDenied), 2);
    assert_eq!(pool.used(), Duration::ZERO);
}
