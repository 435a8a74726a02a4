use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::graph::GraphSnapshot;

#[derive(Debug, Clone, Copy)]
pub struct TaskExecution {
    pub start: Instant,
    pub duration: Duration,
}

/// What an execution request did.
///
/// Returned as part of every [`Execution`](crate::Execution); tasks that were
/// up to date show up in `skipped`, tasks whose body was invoked in
/// `executed`.
#[derive(Debug, Default, Clone)]
pub struct Diagnostics {
    /// Names of the invoked tasks, in the order they started.
    pub executed: Vec<String>,
    /// Timing for each invoked task.
    pub execution_times: HashMap<String, TaskExecution>,
    /// Names of the tasks found up to date.
    pub skipped: Vec<String>,
}

impl Diagnostics {
    pub(crate) fn record(&mut self, name: &str, execution: TaskExecution) {
        self.executed.push(name.to_string());
        self.execution_times.insert(name.to_string(), execution);
    }

    pub(crate) fn skip(&mut self, name: &str) {
        self.skipped.push(name.to_string());
    }

    /// Orders `executed` by start time; parallel runs record completions.
    pub(crate) fn sort_by_start(&mut self) {
        let times = &self.execution_times;
        self.executed.sort_by_key(|name| times.get(name).map(|t| t.start));
    }

    pub fn was_executed(&self, name: &str) -> bool {
        self.execution_times.contains_key(name)
    }

    pub fn was_skipped(&self, name: &str) -> bool {
        self.skipped.iter().any(|s| s == name)
    }

    /// Renders the task graph as a Mermaid diagram, color-coded by execution duration.
    ///
    /// * **Green**: Fast
    /// * **Yellow**: Moderate
    /// * **Red**: Slow
    /// * **Blue**: Cached (skipped)
    ///
    /// Tasks outside this execution request are drawn without a fill.
    pub fn render_mermaid(&self, graph: &GraphSnapshot) -> String {
        let times = &self.execution_times;

        let mut min_time = f64::MAX;
        let mut max_time = f64::MIN;

        for t in times.values() {
            let secs = t.duration.as_secs_f64();
            min_time = min_time.min(secs);
            max_time = max_time.max(secs);
        }

        if min_time > max_time {
            // nothing ran
            min_time = 0.0;
            max_time = 0.0;
        }

        if (max_time - min_time).abs() < f64::EPSILON {
            max_time = min_time + 1.0;
        }

        graph.render_mermaid(|name| {
            if let Some(exec) = times.get(name) {
                let t = (exec.duration.as_secs_f64() - min_time) / (max_time - min_time);
                Some((format!("{:.2?}", exec.duration), heat(t)))
            } else if self.was_skipped(name) {
                Some(("Cached".to_string(), "#ADD8E6".to_string()))
            } else {
                None
            }
        })
    }
}

/// Maps `t` in `0.0..=1.0` onto green, yellow, red.
fn heat(t: f64) -> String {
    let t = t.clamp(0.0, 1.0);

    let (r, g, b) = if t < 0.5 {
        let r = (255.0 * t * 2.0) as u8;
        (r, 255, 0)
    } else {
        let g = (255.0 * (1.0 - (t - 0.5) * 2.0)) as u8;
        (255, g, 0u8)
    };

    format!("#{:02X}{:02X}{:02X}", r, g, b)
}
