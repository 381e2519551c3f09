//! The `monitor` subcommand.
//!
//! Run on a schedule (e.g. from cron). Each invocation takes the
//! single-writer lock, sweeps the monitored directories for completed runs,
//! uploads whatever needs uploading and posts a summary notification. If
//! another invocation still holds the lock this one exits cleanly and the
//! scheduler retries later.

use clap::Args;
use seqferry_common::{
    config::{read_config, Config},
    discovery::get_runs_to_upload,
    lock::{UploadLock, LOCK_FILE_NAME},
    notify,
    pipeline::{process_run, RunUploadPlan},
    prelude::*,
    storage::{s3::S3StorageFactory, ObjectStoreFactory},
    tracing_support,
    uploader::Uploader,
};

/// Command-line options for `monitor`.
#[derive(Args, Debug)]
pub struct Opt {
    /// AWS profile to authenticate with.
    #[arg(long = "profile_name")]
    pub profile_name: String,

    /// Config file describing the directories to monitor.
    #[arg(long = "config")]
    pub config: PathBuf,

    /// Discover and classify runs and log the planned uploads, but upload
    /// nothing.
    #[arg(long = "dry_run")]
    pub dry_run: bool,
}

/// Run one monitor sweep.
pub async fn run(opt: &Opt) -> Result<()> {
    let config = read_config(&opt.config)?;
    tracing_support::check_log_dir_writable(&config.log_dir)?;
    let _guard = tracing_support::initialize_tracing_with_log_file(&config.log_dir)?;
    info!("beginning monitoring directories for runs to upload");

    // Held for the rest of the invocation; dropped (and so released) on
    // every exit path below, including the error ones.
    let lock_path = config.log_dir.join(LOCK_FILE_NAME);
    let _lock = match UploadLock::acquire(&lock_path)? {
        Some(lock) => lock,
        None => {
            info!("another upload process is already running, exiting now");
            return Ok(());
        }
    };

    let factory: Arc<dyn ObjectStoreFactory> =
        Arc::new(S3StorageFactory::new(Some(&opt.profile_name)));
    check_remote_access(factory.as_ref(), &config).await?;

    let plans = discover_upload_plans(&config)?;
    if plans.is_empty() {
        info!("no sequencing runs requiring upload found, exiting now");
        return Ok(());
    }

    if opt.dry_run {
        for plan in &plans {
            info!(
                "dry run: would upload {} to s3://{}/{}",
                plan.run_id,
                plan.target.bucket,
                plan.target.remote_path.trim_start_matches('/'),
            );
        }
        info!("dry run, exiting without uploading");
        return Ok(());
    }

    // Files still in flight when an interrupt lands are recorded neither as
    // successes nor failures; the next invocation picks the runs back up as
    // partial. Returning releases the lock either way.
    tokio::select! {
        result = upload_runs(&config, factory, &plans) => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupt received, abandoning in-flight uploads");
            Err(format_err!("upload interrupted by signal"))
        }
    }
}

/// Check that our credentials work and every configured bucket is reachable.
/// Either failing is fatal for the whole invocation.
async fn check_remote_access(factory: &dyn ObjectStoreFactory, config: &Config) -> Result<()> {
    let store = factory
        .connect()
        .await
        .context("could not construct object store client")?;
    let buckets = store
        .list_buckets()
        .await
        .context("could not authenticate with AWS, check credentials are valid")?;
    debug!("credentials valid, {} buckets visible", buckets.len());

    for bucket in config.buckets() {
        store.head_bucket(&bucket).await?;
    }
    Ok(())
}

/// Sweep every monitor entry and build the ordered upload plan list:
/// partially uploaded runs first, then new runs.
///
/// A run directory reachable through more than one monitor entry is claimed
/// by the first entry that finds it; later entries skip it.
fn discover_upload_plans(config: &Config) -> Result<Vec<RunUploadPlan>> {
    let mut partial_plans = vec![];
    let mut new_plans = vec![];
    let mut claimed = BTreeSet::new();

    for entry in &config.monitor {
        let sample_filter = entry.sample_filter()?;
        let mut discovered = get_runs_to_upload(
            &entry.monitored_directories,
            &config.log_dir,
            sample_filter.as_ref(),
        );
        discovered
            .partial_runs
            .retain(|(run_dir, _)| claimed.insert(run_dir.clone()));
        discovered
            .new_runs
            .retain(|run_dir| claimed.insert(run_dir.clone()));

        for (run_dir, uploaded) in discovered.partial_runs {
            partial_plans.push(RunUploadPlan::new(
                &run_dir,
                &entry.bucket,
                &entry.remote_path,
                uploaded,
                &entry.exclude_patterns,
            )?);
        }
        for run_dir in discovered.new_runs {
            new_plans.push(RunUploadPlan::new(
                &run_dir,
                &entry.bucket,
                &entry.remote_path,
                BTreeSet::new(),
                &entry.exclude_patterns,
            )?);
        }
    }

    if !new_plans.is_empty() {
        info!(
            "found {} new sequencing runs to upload: {}",
            new_plans.len(),
            run_id_listing(&new_plans),
        );
    }
    if !partial_plans.is_empty() {
        info!(
            "found {} partially uploaded runs to continue uploading: {}",
            partial_plans.len(),
            run_id_listing(&partial_plans),
        );
    }

    partial_plans.extend(new_plans);
    Ok(partial_plans)
}

fn run_id_listing(plans: &[RunUploadPlan]) -> String {
    plans
        .iter()
        .map(|plan| plan.run_id.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Upload every planned run, then post the summary notifications.
async fn upload_runs(
    config: &Config,
    factory: Arc<dyn ObjectStoreFactory>,
    plans: &[RunUploadPlan],
) -> Result<()> {
    let uploader = Uploader::new(factory, config.threads());
    let cores = config.cores();

    let mut succeeded_runs = vec![];
    let mut failed_runs = vec![];
    for plan in plans {
        let record = process_run(plan, &uploader, cores, &config.log_dir).await?;
        if record.completed {
            succeeded_runs.push(plan.run_id.clone());
        } else {
            failed_runs.push(plan.run_id.clone());
        }
    }

    notify::send_notifications(
        config.log_webhook(),
        config.alert_webhook(),
        &succeeded_runs,
        &failed_runs,
    )
    .await;
    Ok(())
}
