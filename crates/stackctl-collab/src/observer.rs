use stackctl_types::ReleaseId;

/// Minimal sink for free-text progress lines, implemented by the CLI as a
/// stderr writer. Durable state lives in the event log (`stackctl-store`),
/// not here — a `Reporter` is for a human watching a terminal, nothing else
/// reads it back.
pub trait Reporter: Send {
    fn info(&mut self, msg: &str);
    fn warn(&mut self, msg: &str);
    fn error(&mut self, msg: &str);
}

/// A [`Reporter`] that discards everything. Useful in tests and as the
/// default when no CLI is attached.
#[derive(Debug, Default)]
pub struct NullObserver;

impl Reporter for NullObserver {
    fn info(&mut self, _msg: &str) {}
    fn warn(&mut self, _msg: &str) {}
    fn error(&mut self, _msg: &str) {}
}

/// The `EventObserver` collaborator from the spec's external-interfaces
/// table, implemented here as a thin adapter over a [`Reporter`] — phase
/// transitions and diffs get a human-readable line; the structured record
/// is still the event log the Node Executor appends to directly.
pub trait EventObserver: Send {
    fn phase_started(&mut self, node: &ReleaseId, phase: &str);
    fn phase_completed(&mut self, node: &ReleaseId, phase: &str, status: &str, message: &str);
    fn emit_event(&mut self, level: &str, message: &str);
    fn set_diff(&mut self, node: &ReleaseId, text: &str);
}

/// Forwards every `EventObserver` callback to a [`Reporter`] as a formatted
/// line. This is the only `EventObserver` this crate ships; node executors
/// in tests typically use a recording fake instead.
pub struct ReporterObserver<'a> {
    reporter: &'a mut dyn Reporter,
}

impl<'a> ReporterObserver<'a> {
    pub fn new(reporter: &'a mut dyn Reporter) -> Self {
        Self { reporter }
    }
}

impl<'a> EventObserver for ReporterObserver<'a> {
    fn phase_started(&mut self, node: &ReleaseId, phase: &str) {
        self.reporter.info(&format!("{node}: {phase} started"));
    }

    fn phase_completed(&mut self, node: &ReleaseId, phase: &str, status: &str, message: &str) {
        let line = format!("{node}: {phase} {status}: {message}");
        if status == "failed" {
            self.reporter.error(&line);
        } else {
            self.reporter.info(&line);
        }
    }

    fn emit_event(&mut self, level: &str, message: &str) {
        match level {
            "error" => self.reporter.error(message),
            "warn" => self.reporter.warn(message),
            _ => self.reporter.info(message),
        }
    }

    fn set_diff(&mut self, node: &ReleaseId, text: &str) {
        self.reporter.info(&format!("{node}: diff\n{text}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingReporter {
        lines: Vec<String>,
    }

    impl Reporter for RecordingReporter {
        fn info(&mut self, msg: &str) {
            self.lines.push(format!("[info] {msg}"));
        }
        fn warn(&mut self, msg: &str) {
            self.lines.push(format!("[warn] {msg}"));
        }
        fn error(&mut self, msg: &str) {
            self.lines.push(format!("[error] {msg}"));
        }
    }

    #[test]
    fn phase_completed_failed_status_logs_as_error() {
        let mut reporter = RecordingReporter::default();
        let node: ReleaseId = "c1/ns/a".parse().unwrap();
        {
            let mut observer = ReporterObserver::new(&mut reporter);
            observer.phase_completed(&node, "wait", "failed", "timeout");
        }
        assert_eq!(reporter.lines, vec!["[error] c1/ns/a: wait failed: timeout"]);
    }
}
