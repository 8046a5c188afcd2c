// src/privileged.rs
//
// Elevated command execution on worker threads, with results delivered
// back over a channel.

use log::{debug, error, info};

use std::collections::BTreeMap;
use std::fmt;
use std::process::{Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecOutcome {
    Success,
    /// The user dismissed the authentication prompt.
    Cancelled,
    Failed(String),
}

impl ExecOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecOutcome::Success)
    }
}

impl fmt::Display for ExecOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecOutcome::Success => write!(f, "success"),
            ExecOutcome::Cancelled => write!(f, "cancelled"),
            ExecOutcome::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Runs one shell command line with elevated privileges, blocking until done.
pub trait Elevator: Send + Sync + 'static {
    fn run(&self, command: &str) -> ExecOutcome;
}

/// Map a pkexec exit status to an outcome.
pub fn classify_exit(code: Option<i32>, stderr: &str) -> ExecOutcome {
    match code {
        Some(0) => ExecOutcome::Success,
        Some(126) => ExecOutcome::Cancelled,
        Some(127) => ExecOutcome::Failed("not authorized or command not found".into()),
        Some(code) if stderr.trim().is_empty() => ExecOutcome::Failed(format!("exit status {}", code)),
        Some(code) => ExecOutcome::Failed(format!("exit status {}: {}", code, stderr.trim())),
        None => ExecOutcome::Failed("terminated by signal".into()),
    }
}

/// `pkexec sh -c <command>`.
pub struct Pkexec;

impl Elevator for Pkexec {
    fn run(&self, command: &str) -> ExecOutcome {
        let output = Command::new("pkexec")
            .args(["sh", "-c", command])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output();

        match output {
            Ok(out) => classify_exit(out.status.code(), &String::from_utf8_lossy(&out.stderr)),
            Err(e) => ExecOutcome::Failed(format!("could not start pkexec: {}", e)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ticket(u64);

#[derive(Debug)]
pub struct Completion<T> {
    pub ticket: Ticket,
    pub payload: T,
    pub outcome: ExecOutcome,
}

/// Each submitted command runs on its own thread; completions are picked
/// up by the owner with `try_completions` or `wait_completion`. Failed
/// commands are never retried.
pub struct PrivilegedExecutor<T> {
    elevator: Arc<dyn Elevator>,
    tx: Sender<(Ticket, ExecOutcome)>,
    rx: Receiver<(Ticket, ExecOutcome)>,
    pending: BTreeMap<Ticket, T>,
    next_ticket: u64,
}

impl<T> PrivilegedExecutor<T> {
    pub fn new(elevator: Arc<dyn Elevator>) -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            elevator,
            tx,
            rx,
            pending: BTreeMap::new(),
            next_ticket: 0,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// Start `command` and return immediately. `payload` comes back with
    /// the completion.
    pub fn submit(&mut self, command: String, payload: T) -> Ticket {
        let ticket = Ticket(self.next_ticket);
        self.next_ticket += 1;
        self.pending.insert(ticket, payload);

        let elevator = Arc::clone(&self.elevator);
        let tx = self.tx.clone();
        debug!("Submitting privileged command #{}: {}", ticket.0, command);

        let spawned = thread::Builder::new()
            .name(format!("privileged-{}", ticket.0))
            .spawn(move || {
                let outcome = elevator.run(&command);
                // receiver gone means the owner shut down
                let _ = tx.send((ticket, outcome));
            });

        if let Err(e) = spawned {
            let _ = self
                .tx
                .send((ticket, ExecOutcome::Failed(format!("could not spawn worker: {}", e))));
        }
        ticket
    }

    fn complete(&mut self, ticket: Ticket, outcome: ExecOutcome) -> Option<Completion<T>> {
        let payload = self.pending.remove(&ticket)?;
        match &outcome {
            ExecOutcome::Success => debug!("Privileged command #{} succeeded", ticket.0),
            ExecOutcome::Cancelled => info!("Privileged command #{} cancelled by user", ticket.0),
            ExecOutcome::Failed(reason) => {
                error!("Privileged command #{} failed: {}", ticket.0, reason)
            }
        }
        Some(Completion {
            ticket,
            payload,
            outcome,
        })
    }

    /// Every completion that has arrived, without blocking.
    pub fn try_completions(&mut self) -> Vec<Completion<T>> {
        let arrived: Vec<(Ticket, ExecOutcome)> = self.rx.try_iter().collect();
        arrived
            .into_iter()
            .filter_map(|(ticket, outcome)| self.complete(ticket, outcome))
            .collect()
    }

    /// Block up to `timeout` for the next completion.
    pub fn wait_completion(&mut self, timeout: Duration) -> Option<Completion<T>> {
        if self.pending.is_empty() {
            return None;
        }
        match self.rx.recv_timeout(timeout) {
            Ok((ticket, outcome)) => self.complete(ticket, outcome),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records commands and answers with a fixed outcome.
    pub(crate) struct ScriptedElevator {
        pub outcome: ExecOutcome,
        pub commands: Mutex<Vec<String>>,
    }

    impl ScriptedElevator {
        pub(crate) fn new(outcome: ExecOutcome) -> Arc<Self> {
            Arc::new(Self {
                outcome,
                commands: Mutex::new(Vec::new()),
            })
        }

        pub(crate) fn commands(&self) -> Vec<String> {
            self.commands.lock().unwrap().clone()
        }
    }

    impl Elevator for ScriptedElevator {
        fn run(&self, command: &str) -> ExecOutcome {
            self.commands.lock().unwrap().push(command.to_string());
            self.outcome.clone()
        }
    }

    /// Blocks until released, standing in for a pending password prompt.
    struct GatedElevator {
        gate: Mutex<Receiver<()>>,
    }

    impl Elevator for GatedElevator {
        fn run(&self, _command: &str) -> ExecOutcome {
            let _ = self.gate.lock().unwrap().recv();
            ExecOutcome::Success
        }
    }

    #[test]
    fn test_classify_exit() {
        assert_eq!(classify_exit(Some(0), ""), ExecOutcome::Success);
        assert_eq!(classify_exit(Some(126), ""), ExecOutcome::Cancelled);
        assert!(matches!(classify_exit(Some(127), ""), ExecOutcome::Failed(_)));
        assert_eq!(
            classify_exit(Some(1), "tee: permission denied\n"),
            ExecOutcome::Failed("exit status 1: tee: permission denied".into())
        );
        assert!(matches!(classify_exit(None, ""), ExecOutcome::Failed(_)));
    }

    #[test]
    fn test_completion_carries_payload() {
        let elevator = ScriptedElevator::new(ExecOutcome::Cancelled);
        let mut executor = PrivilegedExecutor::new(elevator.clone());

        let ticket = executor.submit("echo 1 | tee /x".into(), "boost");
        let done = executor.wait_completion(Duration::from_secs(5)).unwrap();
        assert_eq!(done.ticket, ticket);
        assert_eq!(done.payload, "boost");
        assert_eq!(done.outcome, ExecOutcome::Cancelled);
        assert_eq!(elevator.commands(), vec!["echo 1 | tee /x".to_string()]);
        assert_eq!(executor.in_flight(), 0);
        assert!(executor.wait_completion(Duration::from_millis(10)).is_none());
    }

    #[test]
    fn test_submit_does_not_block() {
        let (release, gate) = mpsc::channel();
        let elevator = Arc::new(GatedElevator { gate: Mutex::new(gate) });
        let mut executor = PrivilegedExecutor::new(elevator);

        executor.submit("true".into(), ());
        assert!(executor.try_completions().is_empty());
        assert_eq!(executor.in_flight(), 1);

        release.send(()).unwrap();
        assert!(executor.wait_completion(Duration::from_secs(5)).is_some());
    }
}
