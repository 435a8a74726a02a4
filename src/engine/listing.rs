//! Read-only views of the registries for listing tasks and artifacts.

use std::fmt;

use camino::Utf8PathBuf;
use console::Style;

use crate::task::Task;

const ANSI_GREEN: Style = Style::new().green();
const ANSI_YELLOW: Style = Style::new().yellow();
const ANSI_BLUE: Style = Style::new().blue();

/// The run state of one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskStatus {
    pub name: String,
    pub description: Option<String>,
    pub has_run: bool,
    pub up_to_date: bool,
    pub needs_run: bool,
    /// Restored from the state file and not registered in this session.
    pub inert: bool,
}

impl From<&Task> for TaskStatus {
    fn from(task: &Task) -> Self {
        let staleness = task.staleness();
        Self {
            name: task.name().to_string(),
            description: task.description().map(str::to_string),
            has_run: staleness.has_run(),
            up_to_date: staleness.outputs_up_to_date(),
            needs_run: staleness.needs_run(),
            inert: task.is_inert(),
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ran = if self.has_run { 'R' } else { '-' };
        let fresh = if self.up_to_date { 'U' } else { '-' };
        let flags = format!("[{ran}{fresh}]");

        if self.needs_run {
            write!(f, "{} {}", ANSI_YELLOW.apply_to(flags), self.name)?;
        } else {
            write!(f, "{} {}", ANSI_GREEN.apply_to(flags), self.name)?;
        }

        if let Some(description) = &self.description {
            write!(f, "  {}", ANSI_BLUE.apply_to(description))?;
        }
        if self.inert {
            write!(f, "  {}", ANSI_BLUE.apply_to("(not registered)"))?;
        }

        Ok(())
    }
}

/// One artifact with the tasks linked to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactEntry {
    pub name: String,
    pub path: Utf8PathBuf,
    pub exists: bool,
    /// `None` for source artifacts that no task provides.
    pub producer: Option<String>,
    pub consumers: Vec<String>,
}

impl fmt::Display for ArtifactEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.exists {
            write!(f, "{}", self.name)?;
        } else {
            write!(f, "{}", ANSI_BLUE.apply_to(&self.name))?;
        }

        match &self.producer {
            Some(producer) => write!(f, "  <- {}", ANSI_GREEN.apply_to(producer))?,
            None => write!(f, "  <- {}", ANSI_BLUE.apply_to("(source)"))?,
        }

        if !self.consumers.is_empty() {
            write!(f, "  -> {}", self.consumers.join(", "))?;
        }

        Ok(())
    }
}
