//! Launch pipeline: reconcile, prepare the dataset, then launch workers

use std::ffi::OsString;
use std::sync::Arc;

use dataset_cache::{DatasetBuilder, DatasetPreparationGate, PackedBundleBuilder};
use launch_core::{
    reconcile, select_seed, Error, HostTopologyProvider, LaunchPlan, Result, RunNameParts,
    SystemTopology, TopologyDescriptor,
};
use tracing::{error, info, instrument, warn};
use worker_pool::{
    run_worker_from_env, FailurePolicy, LaunchMode, LaunchReport, ProcessTopologyLauncher,
    ReexecSpawner, WorkerEntry, WorkerSpawner,
};

use crate::cli::{Cli, Commands, RunArgs};
use crate::{ExternalTrainer, RunFilesystem};

/// The collaborators one launch runs with
pub struct Orchestrator {
    host: Arc<dyn HostTopologyProvider>,
    builder: Arc<dyn DatasetBuilder>,
    entry: Arc<dyn WorkerEntry>,
    spawner: Arc<dyn WorkerSpawner>,
}

impl Orchestrator {
    pub fn new(
        host: Arc<dyn HostTopologyProvider>,
        builder: Arc<dyn DatasetBuilder>,
        entry: Arc<dyn WorkerEntry>,
        spawner: Arc<dyn WorkerSpawner>,
    ) -> Self {
        Self {
            host,
            builder,
            entry,
            spawner,
        }
    }

    /// Host topology from the environment, packed bundles, the external
    /// trainer inline and re-executed `launch worker` processes for fan-out
    pub fn system() -> Result<Self> {
        Ok(Self::new(
            Arc::new(SystemTopology::new()),
            Arc::new(PackedBundleBuilder::new()),
            Arc::new(ExternalTrainer),
            Arc::new(ReexecSpawner::current_exe(vec![OsString::from("worker")])?),
        ))
    }

    /// Build the plan every worker of this node is started from
    #[instrument(skip_all, fields(cfg_file = %args.cfg_file.display()))]
    pub async fn plan(&self, args: &RunArgs) -> Result<LaunchPlan> {
        if !args.has_operating_mode() {
            return Err(Error::Usage {
                message: "at least one operating mode flag is required".to_string(),
            });
        }

        let current_device = self.host.current_device();
        let mut config = reconcile(&args.cfg_file, &args.to_overrides(), self.host.as_ref())?;
        let topology = TopologyDescriptor::from_config(&config, current_device)?;

        let run_name = RunNameParts::now(&config.run.framework(), config.run.phase())
            .render(&config.run.run_name_template)?;
        info!(run_name = %run_name, "Run name assigned");

        let gate = DatasetPreparationGate::new(Arc::clone(&self.builder), &config.run.save_dir);
        let dataset = gate.prepare_for(&config).await?;

        let seed = select_seed(config.run.seed)?;
        config.record_effective(&seed, &dataset)?;

        Ok(LaunchPlan {
            config: Arc::new(config),
            topology,
            seed,
            run_name,
            dataset,
        })
    }

    /// Launch the workers of a plan and wait for all of them
    pub async fn launch(&self, plan: &LaunchPlan) -> Result<LaunchReport> {
        let policy = if plan.config.run.abort_on_failure {
            FailurePolicy::CancelOnFailure
        } else {
            FailurePolicy::JoinAll
        };
        let launcher =
            ProcessTopologyLauncher::new(Arc::clone(&self.entry), Arc::clone(&self.spawner))
                .with_policy(policy)
                .with_preconditions(Arc::new(RunFilesystem::from_config(&plan.config)));

        let interrupt = match ProcessTopologyLauncher::mode_for(&plan.topology, plan.distributed())
        {
            LaunchMode::FanOut => {
                let token = launcher.cancellation_token();
                Some(tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        warn!("Interrupted; terminating workers");
                        token.cancel();
                    }
                }))
            }
            LaunchMode::Inline => None,
        };

        let report = launcher
            .launch(&plan.topology, plan.distributed(), |rank| plan.context(rank))
            .await;

        if let Some(handle) = interrupt {
            handle.abort();
        }
        report
    }

    /// Plan and launch one run
    pub async fn run(&self, args: &RunArgs) -> Result<LaunchReport> {
        let plan = self.plan(args).await?;
        self.launch(&plan).await?.into_result()
    }
}

/// Process exit code for the result of a launch
pub fn exit_code(result: &Result<LaunchReport>) -> i32 {
    match result {
        Ok(report) if report.is_success() => 0,
        Ok(report) => Error::WorkerFailure {
            failed_ranks: report.failed_ranks(),
            total: report.outcomes.len(),
        }
        .exit_code(),
        Err(e) => e.exit_code(),
    }
}

/// Parse `args` and run the requested command; returns the exit code
pub async fn run_cli<I, T>(args: I) -> i32
where
    I: IntoIterator<Item = T>,
    T: Into<OsString>,
{
    let cli = match Cli::try_parse_args(args) {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() { 1 } else { 0 };
        }
    };

    match cli.command {
        Some(Commands::Worker) => match run_worker_from_env(&ExternalTrainer).await {
            Ok(()) => 0,
            Err(e) => {
                error!(error = %e, "Worker failed");
                e.exit_code()
            }
        },
        None => {
            if !cli.run.has_operating_mode() {
                eprintln!("{}", Cli::help());
                return 1;
            }

            let result = match Orchestrator::system() {
                Ok(orchestrator) => orchestrator.run(&cli.run).await,
                Err(e) => Err(e),
            };
            match &result {
                Ok(report) => info!(workers = report.outcomes.len(), "Run finished"),
                Err(e) => error!(error = %e, "Run failed"),
            }
            exit_code(&result)
        }
    }
}
