use super::Liveness;
use crate::error::Result;
use crate::machine::StateMachine;
use crate::observe::Event;

use std::time::Duration;

/// Runs one role until the liveness flag clears or the machine fails.
///
/// Each tick idles for `tick` while dispatching completions, checks the
/// flag, performs at most one state-advancing step and then dispatches
/// anything the step completed inline. The machine is torn down on every
/// exit path, setup failures included, and completions already queued are
/// drained afterwards.
pub(crate) fn drive<M: StateMachine>(machine: &mut M, liveness: &Liveness, tick: Duration) -> Result<()> {
    machine.port().observe(Event::Running);

    let outcome = machine.prepare().and_then(|_| run(machine, liveness, tick));
    let closed = machine.teardown();
    let drained = machine.settle().map(|_| ());

    let outcome = outcome.and(closed).and(drained);

    machine.port().observe(Event::Exited {
        error: outcome.as_ref().err().map(|err| err.to_string()),
    });

    outcome
}

fn run<M: StateMachine>(machine: &mut M, liveness: &Liveness, tick: Duration) -> Result<()> {
    while liveness.is_alive() {
        machine.pump(tick)?;

        if !liveness.is_alive() {
            break;
        }

        machine.step()?;
        machine.settle()?;
    }

    Ok(())
}
