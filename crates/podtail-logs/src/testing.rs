//! Handlers that record what they were given, for tailer and watcher tests

use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::handler::{LineHandler, LineHandlerFactory};

pub(crate) type Lines = Arc<Mutex<Vec<String>>>;

pub(crate) struct RecordingHandler {
    pub lines: Lines,
}

impl RecordingHandler {
    pub fn new() -> (Self, Lines) {
        let lines = Lines::default();
        (
            Self {
                lines: Arc::clone(&lines),
            },
            lines,
        )
    }
}

impl LineHandler for RecordingHandler {
    fn handle(&mut self, line: &str) {
        self.lines.lock().push(line.to_string());
    }
}

/// Keeps every handler it hands out, in creation order
#[derive(Default)]
pub(crate) struct RecordingFactory {
    pub handlers: Mutex<Vec<(PathBuf, Lines)>>,
}

impl RecordingFactory {
    /// Lines of every handler created for `path`, oldest handler first
    pub fn lines_for(&self, path: &Path) -> Vec<Vec<String>> {
        self.handlers
            .lock()
            .iter()
            .filter(|(p, _)| p == path)
            .map(|(_, lines)| lines.lock().clone())
            .collect()
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.lock().len()
    }
}

impl LineHandlerFactory for RecordingFactory {
    fn new_handler(&self, path: &Path) -> Box<dyn LineHandler> {
        let (handler, lines) = RecordingHandler::new();
        self.handlers.lock().push((path.to_path_buf(), lines));
        Box::new(handler)
    }
}

/// Poll `condition` until it holds or two seconds pass
pub(crate) async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
