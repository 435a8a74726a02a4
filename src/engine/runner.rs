mod diagnostics;

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Instant;

use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::core::{ArcStr, Clock, Dynamic};
use crate::error::ExecuteError;
use crate::task::{Body, Task, TaskRegistry};
use crate::utils::{PROGRESS_STYLE, TASK_STYLE, panic_message};

pub use diagnostics::{Diagnostics, TaskExecution};

/// The result of an execution request.
#[derive(Debug)]
pub struct Execution {
    /// Value returned by the last task whose body ran, `None` when every
    /// task was up to date.
    pub output: Option<Dynamic>,
    pub diagnostics: Diagnostics,
}

impl Execution {
    /// The output, if a task ran and returned a `T`.
    pub fn output<T: 'static>(&self) -> Option<&T> {
        self.output.as_ref()?.downcast_ref()
    }

    pub fn into_output(self) -> Option<Dynamic> {
        self.output
    }
}

fn root_span(total: usize) -> tracing::Span {
    let span = tracing::span!(Level::INFO, "execute", tasks = total);
    span.pb_set_length(total as u64);
    span.pb_set_style(&PROGRESS_STYLE);
    span.pb_set_message("Running tasks...");
    span
}

/// Runs a body inside its own span, converting a panic into an error.
fn invoke(task: &Task, body: &dyn Body) -> anyhow::Result<Dynamic> {
    let span = tracing::span!(Level::INFO, "task", name = task.name());
    span.pb_set_style(&TASK_STYLE);
    span.pb_set_message(&format!("Running {}", task.name()));
    let _enter = span.enter();

    let context = task.context();

    // A panicking body only leaves its own outputs half-written, which the
    // staleness rules already treat as not up to date.
    match catch_unwind(AssertUnwindSafe(|| body.call(&context))) {
        Ok(result) => result,
        Err(panic) => Err(anyhow::anyhow!(panic_message(panic))),
    }
}

/// Checks whether `task` must run and, if so, stamps its call time.
/// Returns the body to invoke, or `None` when the task is up to date.
fn prepare(task: &mut Task, clock: &Clock) -> Result<Option<Arc<dyn Body>>, ExecuteError> {
    if !task.needs_run() {
        return Ok(None);
    }

    let Some(body) = task.body.clone() else {
        return Err(ExecuteError::Inert(task.name().to_string()));
    };

    task.call_time = clock.now();
    Ok(Some(body))
}

/// Walks `order` one task at a time, stopping at the first failure.
pub(crate) fn run_sequential(
    tasks: &mut TaskRegistry,
    clock: &Clock,
    order: &[ArcStr],
) -> Result<Execution, ExecuteError> {
    let total = order.len();
    let mut diagnostics = Diagnostics::default();
    let mut output = None;

    let root_span = root_span(total);
    let _enter = root_span.enter();

    for (index, name) in order.iter().enumerate() {
        let task = tasks.get_mut(name)?;

        let Some(body) = prepare(task, clock)? else {
            tracing::debug!("{} is up to date", name);
            diagnostics.skip(name);
            root_span.pb_inc(1);
            continue;
        };

        tracing::debug!("running {} ({}/{})", name, index + 1, total);

        let start = Instant::now();
        let result = invoke(task, &*body);
        diagnostics.record(
            name,
            TaskExecution {
                start,
                duration: start.elapsed(),
            },
        );
        root_span.pb_inc(1);

        match result {
            Ok(value) => output = Some(value),
            Err(source) => {
                tracing::error!("task {} failed", name);
                return Err(ExecuteError::Task {
                    name: name.to_string(),
                    position: index + 1,
                    total,
                    source,
                });
            }
        }
    }

    tracing::info!(
        "Executed {} of {} tasks, {} up to date",
        diagnostics.executed.len(),
        total,
        diagnostics.skipped.len()
    );

    Ok(Execution {
        output,
        diagnostics,
    })
}

#[cfg(feature = "parallel")]
pub(crate) use parallel::run_parallel;

#[cfg(feature = "parallel")]
mod parallel {
    use std::collections::HashMap;
    use std::sync::mpsc::{Sender, channel};
    use std::time::Instant;

    use tracing_indicatif::span_ext::IndicatifSpanExt;

    use super::{Diagnostics, Execution, TaskExecution, invoke, prepare, root_span};
    use crate::core::{ArcStr, Clock, Dynamic};
    use crate::error::ExecuteError;
    use crate::graph::Subgraph;
    use crate::task::TaskRegistry;

    enum Outcome {
        Skipped,
        Ran {
            result: anyhow::Result<Dynamic>,
            execution: TaskExecution,
        },
    }

    /// Executes the closure on the rayon pool, scheduling from the calling
    /// thread so that no worker is held up waiting for results.
    ///
    /// A task becomes ready once every producer inside the closure has
    /// completed; only then is its staleness evaluated, and its call time is
    /// stamped here on the scheduling thread before the body is handed to a
    /// worker.
    ///
    /// After the first failure nothing new is launched, bodies already in
    /// flight are allowed to finish.
    pub(crate) fn run_parallel(
        tasks: &mut TaskRegistry,
        clock: &Clock,
        subgraph: &Subgraph,
        order: &[ArcStr],
    ) -> Result<Execution, ExecuteError> {
        let total = order.len();
        let position: HashMap<ArcStr, usize> = order
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i + 1))
            .collect();

        let dependents = subgraph.dependents();
        let mut dependency_counts = subgraph.in_degrees();

        let mut diagnostics = Diagnostics::default();
        let mut failure: Option<ExecuteError> = None;
        let mut last: Option<(usize, Dynamic)> = None;

        let root_span = root_span(total);
        let _enter = root_span.enter();

        rayon::in_place_scope(|s| {
            let (sender, receiver) = channel::<(ArcStr, Outcome)>();

            // Either sends `Skipped` or hands the body to a worker.
            let mut launch = |name: ArcStr,
                              sender: &Sender<(ArcStr, Outcome)>|
             -> Result<(), ExecuteError> {
                let task = tasks.get_mut(&name)?;

                let Some(body) = prepare(task, clock)? else {
                    let _ = sender.send((name, Outcome::Skipped));
                    return Ok(());
                };

                let task = task.clone();
                let sender = sender.clone();

                s.spawn(move |_| {
                    let start = Instant::now();
                    let result = invoke(&task, &*body);
                    let execution = TaskExecution {
                        start,
                        duration: start.elapsed(),
                    };
                    let _ = sender.send((name, Outcome::Ran { result, execution }));
                });

                Ok(())
            };

            let mut ready: Vec<ArcStr> = order
                .iter()
                .filter(|name| dependency_counts.get(*name).copied().unwrap_or(0) == 0)
                .cloned()
                .collect();
            let mut in_flight = 0usize;

            loop {
                // lowest position first
                ready.sort_by_key(|name| std::cmp::Reverse(position[name]));
                while let Some(name) = ready.pop() {
                    if failure.is_some() {
                        ready.clear();
                        break;
                    }
                    match launch(name, &sender) {
                        Ok(()) => in_flight += 1,
                        Err(e) => failure = Some(e),
                    }
                }

                if in_flight == 0 {
                    break;
                }

                let Ok((name, outcome)) = receiver.recv() else {
                    break;
                };
                in_flight -= 1;
                root_span.pb_inc(1);

                match outcome {
                    Outcome::Skipped => {
                        tracing::debug!("{} is up to date", name);
                        diagnostics.skip(&name);
                    }
                    Outcome::Ran { result, execution } => {
                        diagnostics.record(&name, execution);
                        let at = position[&name];

                        match result {
                            Ok(value) => {
                                if last.as_ref().is_none_or(|(prev, _)| *prev < at) {
                                    last = Some((at, value));
                                }
                            }
                            Err(source) => {
                                tracing::error!("task {} failed", name);
                                if failure.is_none() {
                                    failure = Some(ExecuteError::Task {
                                        name: name.to_string(),
                                        position: at,
                                        total,
                                        source,
                                    });
                                }
                                continue;
                            }
                        }
                    }
                }

                for dependent in dependents.get(&name).into_iter().flatten() {
                    if let Some(count) = dependency_counts.get_mut(dependent) {
                        *count -= 1;
                        if *count == 0 {
                            ready.push(dependent.clone());
                        }
                    }
                }
            }
        });

        diagnostics.sort_by_start();

        if let Some(error) = failure {
            return Err(error);
        }

        tracing::info!(
            "Executed {} of {} tasks, {} up to date",
            diagnostics.executed.len(),
            total,
            diagnostics.skipped.len()
        );

        Ok(Execution {
            output: last.map(|(_, value)| value),
            diagnostics,
        })
    }
}
