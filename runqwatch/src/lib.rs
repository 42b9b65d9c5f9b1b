pub mod classify;
pub mod collector;
pub mod error;
pub mod event;
pub mod identity;
pub mod publish;
pub mod settings;
pub mod telemetry;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use anyhow::{Context, Result};
use aya::{Btf, Ebpf, programs::BtfTracePoint};
use aya_log::EbpfLogger;
use log::{info, warn};
use runqwatch_common::{SCHED_SWITCH_PROGRAM, SCHED_WAKEUP_PROGRAM};
use tokio::signal;
use tokio_util::sync::CancellationToken;

use crate::{
    collector::{CollectionLoop, RingBufSource},
    identity::{IdentityCache, IdentityResolver},
    publish::{LogSink, MetricPublisher, MetricSink, ResourceContext},
    settings::Settings,
    telemetry::OtelSink,
};

pub struct RunqWatchEngine {
    pub settings: Settings,
    dry_run: bool,
}

impl RunqWatchEngine {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            dry_run: false,
        }
    }

    /// Log metric points instead of exporting them.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub async fn run(self) -> Result<()> {
        bump_memlock_rlimit()?;

        let object_path = self.settings.probe_object_path();
        info!("Loading probe object {}", object_path.display());
        let mut bpf = Ebpf::load_file(&object_path)
            .with_context(|| format!("Failed to load {}", object_path.display()))?;
        if let Err(e) = EbpfLogger::init(&mut bpf) {
            warn!("Failed to initialize eBPF logger: {}", e);
        }
        attach_sched_probes(&mut bpf)?;
        let source = RingBufSource::from_ebpf(&mut bpf, self.settings.events_map())?;

        let resource = Arc::new(self.settings.resource_context());
        info!(
            "Node {} in cluster '{}' ({})",
            resource.node_name, resource.cluster_name, resource.location
        );
        let (sink, otel) = self.build_sink(&resource)?;

        let cancel = CancellationToken::new();
        let cache = Arc::new(IdentityCache::with_ttl(self.settings.cache_ttl()));
        let lookup = identity::connect(
            self.settings.identity_backend(),
            &self.settings.cgroup_root(),
            &resource.node_name,
            &cache,
            cancel.clone(),
        )
        .await?;
        let resolver = Arc::new(
            IdentityResolver::new(lookup, cache)
                .with_strategy(self.settings.lookup_strategy())
                .with_timeout(self.settings.lookup_timeout()),
        );
        if self.settings.warm_on_start() {
            match resolver.warm().await {
                Ok(count) => info!("Identity cache warmed with {} containers", count),
                Err(e) => warn!("Identity cache warm-up failed: {:#}", e),
            }
        }

        let publisher = MetricPublisher::new(sink, resource)
            .with_prefix(self.settings.metric_prefix())
            .with_timeout(self.settings.publish_timeout());

        let collection =
            CollectionLoop::new(source, resolver, publisher, self.settings.collector_config());
        let handle = collection.start(cancel.clone());

        info!("Monitoring active. Press Ctrl-C to exit.");
        tokio::select! {
            res = signal::ctrl_c() => {
                res?;
                info!("Shutdown signal received");
            }
            _ = handle.stopped() => {
                warn!("Collection loop ended on its own");
            }
        }

        let result = handle.stop().await;
        cancel.cancel();
        if let Some(otel) = otel {
            otel.shutdown();
        }
        drop(bpf);
        info!("Exiting...");

        result.map_err(Into::into)
    }

    fn build_sink(
        &self,
        resource: &ResourceContext,
    ) -> Result<(Arc<dyn MetricSink>, Option<Arc<OtelSink>>)> {
        if self.dry_run {
            info!("Dry run: metric points are logged, not exported");
            return Ok((Arc::new(LogSink), None));
        }

        match telemetry::otlp_endpoint(self.settings.otel_exporter_otlp_endpoint.as_deref()) {
            Some(endpoint) => {
                let otel = Arc::new(OtelSink::init(&endpoint, resource)?);
                Ok((Arc::clone(&otel) as Arc<dyn MetricSink>, Some(otel)))
            }
            None => {
                info!("OTEL_EXPORTER_OTLP_ENDPOINT not set. Metric points are logged.");
                Ok((Arc::new(LogSink), None))
            }
        }
    }
}

/// Load and attach both scheduler programs as BTF tracepoints.
fn attach_sched_probes(bpf: &mut Ebpf) -> Result<()> {
    let btf = Btf::from_sys_fs().context("BTF is required for tp_btf programs")?;
    attach_btf_tracepoint(bpf, &btf, SCHED_WAKEUP_PROGRAM, "sched_wakeup")?;
    attach_btf_tracepoint(bpf, &btf, SCHED_SWITCH_PROGRAM, "sched_switch")?;
    Ok(())
}

fn attach_btf_tracepoint(
    bpf: &mut Ebpf,
    btf: &Btf,
    program_name: &str,
    tracepoint: &str,
) -> Result<()> {
    let program: &mut BtfTracePoint = bpf
        .program_mut(program_name)
        .with_context(|| format!("Failed to find {} program", program_name))?
        .try_into()?;
    program.load(tracepoint, btf)?;
    program
        .attach()
        .with_context(|| format!("Failed to attach tp_btf/{}", tracepoint))?;

    info!("Attached tracepoint: tp_btf/{}", tracepoint);
    Ok(())
}

// eBPF maps live in locked kernel memory; lift RLIMIT_MEMLOCK for older kernels
fn bump_memlock_rlimit() -> Result<()> {
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        warn!("Failed to increase rlimit");
    }
    Ok(())
}
