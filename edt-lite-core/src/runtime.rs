use crate::comm::{ChannelTransport, Transport};
use crate::config::RuntimeConfig;
use crate::errors::{Result, RuntimeError};
use crate::guid::Guid;
use crate::msg::{Payload, PolicyMsg};
use crate::pd::PolicyDomain;
use crate::runlevel::{RlProps, Runlevel, RUNLEVELS_UP};
use crate::scheduler::PriorityScheduler;
use crate::task::EdtContext;
use crate::trace::TraceRecord;
use crate::worker;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// The hosting harness: builds the domains, wires the transport mesh,
/// walks the runlevels up, and winds everything down in reverse order once
/// a shutdown arrives.
pub struct Runtime {
    pub config: RuntimeConfig,
    pds: Vec<Arc<PolicyDomain>>,
    worker_handles: Vec<JoinHandle<()>>,
    pump_handles: Vec<JoinHandle<()>>,
    system_handles: Vec<JoinHandle<()>>,
    trace_sink: Arc<spin::Mutex<Vec<TraceRecord>>>,
}

impl Runtime {
    /// Bring the platform up: CONFIG_PARSE through USER_OK, each runlevel
    /// advanced one phase at a time across every domain, workers joining
    /// the barrier at COMPUTE_OK.
    pub async fn boot(config: RuntimeConfig) -> Result<Runtime> {
        if config.pd_count == 0 || config.workers_per_pd == 0 {
            return Err(RuntimeError::Inval("need at least one domain and worker"));
        }
        let transports = ChannelTransport::mesh(config.pd_count);
        let pds: Vec<Arc<PolicyDomain>> = transports
            .iter()
            .enumerate()
            .map(|(loc, t)| {
                let transport: Arc<dyn Transport> = t.clone();
                PolicyDomain::new(
                    loc as u16,
                    config.pd_count,
                    config.clone(),
                    Arc::new(PriorityScheduler::new()),
                    transport,
                )
            })
            .collect();
        let mut rt = Runtime {
            config,
            pds,
            worker_handles: Vec::new(),
            pump_handles: Vec::new(),
            system_handles: Vec::new(),
            trace_sink: Arc::new(spin::Mutex::new(Vec::new())),
        };
        for rl in RUNLEVELS_UP {
            for phase in 0..rl.phase_count() {
                rt.switch_up(rl, phase).await?;
            }
        }
        tracing::info!(domains = rt.pds.len(), "platform at USER_OK");
        Ok(rt)
    }

    async fn switch_up(&mut self, rl: Runlevel, phase: i8) -> Result<()> {
        let props = RlProps::BRING_UP | RlProps::REQUEST;
        for pd in &self.pds {
            pd.scheduler.switch_runlevel(rl, phase, props);
        }
        match (rl, phase) {
            (Runlevel::ConfigParse, 0) => {
                if self.config.workers_per_pd == 0 {
                    return Err(RuntimeError::Inval("zero workers configured"));
                }
            }
            (Runlevel::NetworkOk, 0) => {
                for pd in &self.pds {
                    self.pump_handles
                        .push(tokio::spawn(worker::comm_pump(pd.clone())));
                }
            }
            (Runlevel::PdOk, 0) => {
                // Every domain learns its neighbors.
                for pd in &self.pds {
                    for loc in 0..pd.nb_pds() {
                        if loc == pd.location() {
                            continue;
                        }
                        let mut msg = PolicyMsg::request(
                            pd.location(),
                            pd.location(),
                            Payload::MgtRegister { loc },
                        );
                        pd.process_message(&mut msg)?;
                    }
                }
            }
            (Runlevel::ComputeOk, 0) => {
                // Workers come online and check in on the shared record.
                let workers = u64::from(self.config.workers_per_pd);
                for pd in &self.pds {
                    pd.rl_switch
                        .begin_phase(Runlevel::ComputeOk, 0, RlProps::BRING_UP, workers);
                    for w in 0..self.config.workers_per_pd {
                        self.worker_handles
                            .push(tokio::spawn(worker::worker_loop(pd.clone(), w)));
                    }
                }
                for pd in &self.pds {
                    pd.rl_switch.wait_phase().await;
                }
            }
            (Runlevel::ComputeOk, 1) => {
                if self.config.system_worker {
                    for pd in &self.pds {
                        self.system_handles.push(tokio::spawn(worker::system_worker(
                            pd.clone(),
                            self.trace_sink.clone(),
                        )));
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    pub fn pd(&self, index: u16) -> Arc<PolicyDomain> {
        self.pds[index as usize].clone()
    }

    pub fn pds(&self) -> &[Arc<PolicyDomain>] {
        &self.pds
    }

    /// Create the blessed main task on domain 0: zero params, zero deps,
    /// runnable immediately.
    pub fn spawn_main<F>(&self, f: F) -> Result<Guid>
    where
        F: Fn(&mut EdtContext) -> Guid + Send + Sync + 'static,
    {
        let pd = &self.pds[0];
        let tpl = pd.edt_template_create("mainEdt", 0, 0, f)?;
        let (edt, _) = pd.edt_create(crate::api::EdtCreate::new(tpl))?;
        Ok(edt)
    }

    /// Block until a shutdown arms, quiesce, tear the runlevels down in
    /// reverse order, and report the error code.
    pub async fn wait_shutdown(&mut self) -> Result<u32> {
        let pd0 = self.pds[0].clone();
        loop {
            let mut notified = std::pin::pin!(pd0.shutdown_notify.notified());
            notified.as_mut().enable();
            if pd0.shutdown_requested() {
                break;
            }
            notified.await;
        }
        // Let in-flight cascades drain before parking the workers.
        let mut idle = 0;
        for _ in 0..400 {
            let busy = self.pds.iter().any(|pd| pd.scheduler.pending() > 0);
            if busy {
                idle = 0;
            } else {
                idle += 1;
                if idle >= 3 {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.teardown().await;
        Ok(pd0.shutdown_code())
    }

    /// TEAR_DOWN walk: highest runlevel first, phases in reverse.
    async fn teardown(&mut self) {
        let props = RlProps::TEAR_DOWN | RlProps::REQUEST;
        for rl in RUNLEVELS_UP.iter().rev() {
            for phase in (0..rl.phase_count()).rev() {
                for pd in &self.pds {
                    pd.scheduler.switch_runlevel(*rl, phase, props);
                }
                match (*rl, phase) {
                    (Runlevel::ComputeOk, 0) => {
                        let workers = u64::from(self.config.workers_per_pd);
                        for pd in &self.pds {
                            pd.rl_switch.begin_phase(
                                Runlevel::ComputeOk,
                                0,
                                RlProps::TEAR_DOWN,
                                workers,
                            );
                            pd.signal_stop();
                        }
                        for pd in &self.pds {
                            pd.rl_switch.wait_phase().await;
                        }
                    }
                    (Runlevel::NetworkOk, 0) => {
                        for pd in &self.pds {
                            pd.transport.close();
                        }
                    }
                    _ => {}
                }
            }
        }
        for h in self.worker_handles.drain(..) {
            let _ = h.await;
        }
        for h in self.system_handles.drain(..) {
            let _ = h.await;
        }
        for h in self.pump_handles.drain(..) {
            let _ = h.await;
        }
        // Whatever the system workers did not drain lands in the sink now.
        for pd in &self.pds {
            let records = pd.trace.drain();
            if !records.is_empty() {
                self.trace_sink.lock().extend(records);
            }
        }
        tracing::info!("platform torn down");
    }

    /// Records captured across the run (populated at teardown and by the
    /// system workers while running).
    pub fn trace_records(&self) -> Vec<TraceRecord> {
        self.trace_sink.lock().clone()
    }
}
