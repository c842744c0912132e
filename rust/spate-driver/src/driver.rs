//! Driver assembly: wire the three agents to the CnC file and run them
//! under the configured threading mode.

use std::sync::Arc;

use spate_primitives::broadcast::BroadcastTransmitter;
use spate_primitives::counters::CountersManager;
use spate_primitives::error_log::DistinctErrorLog;
use spate_primitives::rings::MpscRingBuffer;
use spate_primitives::spsc_queue::SpscQueue;

use crate::agent::{Agent, AgentInvoker, AgentRunner};
use crate::clock::epoch_ms;
use crate::cnc::CncFile;
use crate::conductor::DriverConductor;
use crate::config::{DriverConfig, ThreadingMode};
use crate::error::DriverError;
use crate::loss_report::LossReporter;
use crate::proxy::{
    DriverConductorProxy, ReceiverProxy, SenderProxy, PROXY_QUEUE_CAPACITY,
};
use crate::receiver::DriverReceiver;
use crate::sender::DriverSender;
use crate::system_counters::SystemCounters;

/// A running media driver.
pub struct MediaDriver {
    config: DriverConfig,
    cnc: Option<CncFile>,
    runners: Vec<AgentRunner>,
    invoker: Option<AgentInvoker>,
    closed: bool,
}

impl MediaDriver {
    /// Create the driver directory and CnC file, build the agents, and
    /// start them per the threading mode.
    pub fn launch(config: DriverConfig) -> Result<Self, DriverError> {
        config.validate()?;

        if config.dir_delete_on_start && config.dir.exists() {
            std::fs::remove_dir_all(&config.dir)?;
        }
        std::fs::create_dir_all(&config.dir)?;

        let cnc = CncFile::create(&config.dir, &config)?;
        let command_ring = MpscRingBuffer::new(cnc.to_driver_region())
            .map_err(|e| DriverError::Config(e.to_string()))?;
        let broadcast = BroadcastTransmitter::new(cnc.to_clients_region())
            .map_err(|e| DriverError::Config(e.to_string()))?;
        let mut counters = CountersManager::new(
            cnc.counters_metadata_region(),
            cnc.counters_values_region(),
            config.counter_free_to_reuse_timeout_ms,
        );
        let system = Arc::new(
            SystemCounters::new(&mut counters, epoch_ms())
                .map_err(|e| DriverError::Config(e.to_string()))?,
        );
        let error_log = DistinctErrorLog::new(cnc.error_log_region());
        let loss_reporter = LossReporter::new(cnc.loss_report_region());

        let sender_queue = Arc::new(SpscQueue::new(PROXY_QUEUE_CAPACITY));
        let receiver_queue = Arc::new(SpscQueue::new(PROXY_QUEUE_CAPACITY));
        let conductor_queue = Arc::new(SpscQueue::new(PROXY_QUEUE_CAPACITY));

        let conductor = DriverConductor::new(
            config.clone(),
            command_ring,
            broadcast,
            counters,
            Arc::clone(&system),
            error_log,
            SenderProxy::new(Arc::clone(&sender_queue)),
            ReceiverProxy::new(Arc::clone(&receiver_queue)),
            Arc::clone(&conductor_queue),
        );
        let sender = DriverSender::new(
            sender_queue,
            Arc::clone(&system),
            config.heartbeat_interval_ns,
        );
        let receiver = DriverReceiver::new(
            receiver_queue,
            DriverConductorProxy::new(conductor_queue),
            system,
            loss_reporter,
            config.status_message_timeout_ns,
            config.heartbeat_interval_ns,
        );

        tracing::info!(dir = %config.dir.display(), mode = ?config.threading_mode, "driver launched");

        let mut driver = Self {
            config: config.clone(),
            cnc: Some(cnc),
            runners: Vec::new(),
            invoker: None,
            closed: false,
        };

        match config.threading_mode {
            ThreadingMode::Dedicated => {
                driver
                    .runners
                    .push(AgentRunner::start(Box::new(conductor), config.conductor_idle)?);
                driver
                    .runners
                    .push(AgentRunner::start(Box::new(sender), config.sender_idle)?);
                driver
                    .runners
                    .push(AgentRunner::start(Box::new(receiver), config.receiver_idle)?);
            }
            ThreadingMode::SharedNetwork => {
                driver
                    .runners
                    .push(AgentRunner::start(Box::new(conductor), config.conductor_idle)?);
                let network = crate::agent::CompositeAgent::new(vec![
                    Box::new(sender) as Box<dyn Agent>,
                    Box::new(receiver),
                ]);
                driver
                    .runners
                    .push(AgentRunner::start(Box::new(network), config.shared_idle)?);
            }
            ThreadingMode::Shared => {
                let all = crate::agent::CompositeAgent::new(vec![
                    Box::new(conductor) as Box<dyn Agent>,
                    Box::new(sender),
                    Box::new(receiver),
                ]);
                driver
                    .runners
                    .push(AgentRunner::start(Box::new(all), config.shared_idle)?);
            }
            ThreadingMode::Invoker => {
                let all = crate::agent::CompositeAgent::new(vec![
                    Box::new(conductor) as Box<dyn Agent>,
                    Box::new(sender),
                    Box::new(receiver),
                ]);
                driver.invoker = Some(AgentInvoker::new(Box::new(all)));
            }
        }

        Ok(driver)
    }

    /// Drive one duty cycle in `Invoker` mode.
    pub fn invoke(&mut self) -> std::io::Result<usize> {
        match &mut self.invoker {
            Some(invoker) => invoker.invoke(),
            None => Ok(0),
        }
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Stop the agents (receiver first, conductor last) and remove the
    /// CnC file.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        for runner in self.runners.iter_mut().rev() {
            runner.close();
        }
        self.runners.clear();
        if let Some(mut invoker) = self.invoker.take() {
            invoker.close();
        }
        self.cnc = None;
        tracing::info!("driver closed");
    }
}

impl Drop for MediaDriver {
    fn drop(&mut self) {
        self.close();
    }
}
