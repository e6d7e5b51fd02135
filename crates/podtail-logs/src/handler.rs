use std::path::Path;

/// Receives every complete line of one file, in file order.
///
/// Called synchronously from the tailer's read loop, so a slow handler
/// slows down reading of that file and nothing else.
pub trait LineHandler: Send {
    fn handle(&mut self, line: &str);
}

impl<F> LineHandler for F
where
    F: FnMut(&str) + Send,
{
    fn handle(&mut self, line: &str) {
        self(line)
    }
}

/// Builds one handler per discovered file, so handlers may keep per-file state
pub trait LineHandlerFactory: Send + Sync {
    fn new_handler(&self, path: &Path) -> Box<dyn LineHandler>;
}
