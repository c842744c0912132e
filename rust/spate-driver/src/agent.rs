//! Cooperative agents and idle strategies.
//!
//! An agent is a non-blocking `do_work() -> work count`; an idle strategy
//! decides what to do with the CPU when the count is zero. The runner owns
//! one thread per agent (or composes agents onto a shared thread) and
//! drains them in order on shutdown.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::config::IdleStrategyKind;

/// A cooperatively-scheduled unit of work.
pub trait Agent: Send {
    fn role_name(&self) -> &'static str;

    /// One duty cycle; must not block.
    fn do_work(&mut self) -> io::Result<usize>;

    /// Release resources; called once, on the agent's own thread.
    fn on_close(&mut self) {}
}

/// Idle policy; state is per-thread.
pub struct IdleStrategy {
    kind: IdleStrategyKind,
    spins: u32,
}

impl IdleStrategy {
    pub fn new(kind: IdleStrategyKind) -> Self {
        Self { kind, spins: 0 }
    }

    pub fn idle(&mut self, work_count: usize) {
        if work_count > 0 {
            self.spins = 0;
            return;
        }
        match self.kind {
            IdleStrategyKind::BusySpin => std::hint::spin_loop(),
            IdleStrategyKind::Yielding => std::thread::yield_now(),
            IdleStrategyKind::Sleeping(duration) => std::thread::sleep(duration),
            IdleStrategyKind::Backoff => {
                // Spin, then yield, then park briefly, doubling up to 1 ms.
                self.spins = self.spins.saturating_add(1);
                if self.spins < 64 {
                    std::hint::spin_loop();
                } else if self.spins < 128 {
                    std::thread::yield_now();
                } else {
                    let exp = (self.spins - 128).min(7);
                    std::thread::sleep(Duration::from_micros(8 << exp));
                }
            }
        }
    }
}

/// Runs one agent on a dedicated thread until signalled.
pub struct AgentRunner {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    role_name: &'static str,
}

impl AgentRunner {
    pub fn start(mut agent: Box<dyn Agent>, idle: IdleStrategyKind) -> io::Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let role_name = agent.role_name();
        let thread_flag = Arc::clone(&running);

        let handle = std::thread::Builder::new()
            .name(format!("spate-{role_name}"))
            .spawn(move || {
                let mut idle = IdleStrategy::new(idle);
                while thread_flag.load(Ordering::Acquire) {
                    match agent.do_work() {
                        Ok(work_count) => idle.idle(work_count),
                        Err(e) => {
                            tracing::error!("{} duty cycle failed: {e}", agent.role_name());
                            idle.idle(0);
                        }
                    }
                }
                agent.on_close();
            })?;

        Ok(Self { running, handle: Some(handle), role_name })
    }

    /// Signal the agent and join its thread.
    pub fn close(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("{} thread panicked", self.role_name);
            }
        }
    }
}

impl Drop for AgentRunner {
    fn drop(&mut self) {
        self.close();
    }
}

/// Several agents sharing one thread; work counts compose.
pub struct CompositeAgent {
    agents: Vec<Box<dyn Agent>>,
}

impl CompositeAgent {
    pub fn new(agents: Vec<Box<dyn Agent>>) -> Self {
        Self { agents }
    }
}

impl Agent for CompositeAgent {
    fn role_name(&self) -> &'static str {
        "composite"
    }

    fn do_work(&mut self) -> io::Result<usize> {
        let mut work_count = 0;
        for agent in &mut self.agents {
            work_count += agent.do_work()?;
        }
        Ok(work_count)
    }

    fn on_close(&mut self) {
        // Reverse dependency order: the list is built receiver-last so
        // closing walks Receiver → Sender → Conductor.
        for agent in self.agents.iter_mut().rev() {
            agent.on_close();
        }
    }
}

/// Caller-driven mode: the embedding application invokes the duty cycle.
pub struct AgentInvoker {
    agent: Box<dyn Agent>,
    closed: bool,
}

impl AgentInvoker {
    pub fn new(agent: Box<dyn Agent>) -> Self {
        Self { agent, closed: false }
    }

    pub fn invoke(&mut self) -> io::Result<usize> {
        if self.closed {
            return Ok(0);
        }
        self.agent.do_work()
    }

    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.agent.on_close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingAgent {
        counter: Arc<AtomicUsize>,
        closed: Arc<AtomicBool>,
    }

    impl Agent for CountingAgent {
        fn role_name(&self) -> &'static str {
            "counting"
        }

        fn do_work(&mut self) -> io::Result<usize> {
            self.counter.fetch_add(1, Ordering::Relaxed);
            Ok(0)
        }

        fn on_close(&mut self) {
            self.closed.store(true, Ordering::Release);
        }
    }

    #[test]
    fn runner_drives_and_closes_agent() {
        let counter = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicBool::new(false));
        let agent = CountingAgent { counter: Arc::clone(&counter), closed: Arc::clone(&closed) };

        let mut runner =
            AgentRunner::start(Box::new(agent), IdleStrategyKind::Yielding).unwrap();
        while counter.load(Ordering::Relaxed) < 10 {
            std::thread::yield_now();
        }
        runner.close();
        assert!(closed.load(Ordering::Acquire));
    }

    #[test]
    fn composite_sums_work() {
        let counter = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicBool::new(false));
        let mut composite = CompositeAgent::new(vec![
            Box::new(CountingAgent { counter: Arc::clone(&counter), closed: Arc::clone(&closed) }),
            Box::new(CountingAgent { counter: Arc::clone(&counter), closed: Arc::clone(&closed) }),
        ]);
        composite.do_work().unwrap();
        assert_eq!(counter.load(Ordering::Relaxed), 2);
    }
}
