//! The per-account sync loop and the multi-account driver.
//!
//! One account runs as a state machine: authenticate, run a pass over the
//! filtered asset set, realize deletions, then either finish, sleep for the
//! watch interval, re-authenticate, or back off — depending on how the pass
//! ended. Accounts run strictly in sequence; a fatal error in one does not
//! halt the others.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::auth::providers::{mfa_provider_for, ProviderChain};
use crate::auth::Authenticator;
use crate::config::{AccountConfig, GlobalConfig};
use crate::delete::{self, DeleteMode, RemoteDeleteIntent};
use crate::download::{Downloader, EngineOptions, NoopObserver, ReconcileEngine, SyncObserver};
use crate::error::{SyncError, SyncResult};
use crate::local;
use crate::naming::NamingPolicy;
use crate::notify::{NotifierSet, ReauthNotifier, ScriptNotifier};
use crate::photos::{AssetIterator, IterationFilter, PhotoLibrary, PhotosService};
use crate::retry::RetryConfig;
use crate::selector::SelectorOptions;
use crate::session::{Session, SharedSession};

/// Watch intervals below this are raised to it; tighter loops trip the
/// service's rate thresholds.
const MIN_WATCH_INTERVAL_SECS: u64 = 30;

/// Re-authentication attempts per configuration before giving up.
const MAX_REAUTH_ATTEMPTS: u32 = 3;

/// Consecutive transient pass failures tolerated outside watch mode.
const MAX_TRANSIENT_FAILURES: u32 = 5;

/// Tally of one pass over the asset set.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassStats {
    pub downloaded: u64,
    pub existed: u64,
    pub skipped_errors: u64,
    pub remote_deleted: u64,
    pub local_deleted: u64,
}

/// Run every account configuration in sequence. Returns the process exit
/// code: 0 clean (including cancellation), 1 if any configuration failed.
pub async fn run_all(
    global: &GlobalConfig,
    accounts: &[AccountConfig],
    cancel: &CancellationToken,
) -> i32 {
    let mut exit_code = 0;
    for account in accounts {
        if cancel.is_cancelled() {
            break;
        }
        tracing::info!("Starting configuration for {}", account.username);
        match run_account(global, account, cancel).await {
            Ok(()) => {}
            Err(SyncError::Cancelled) => break,
            Err(e) => {
                tracing::error!("Configuration for {} failed: {}", account.username, e);
                exit_code = 1;
            }
        }
    }
    exit_code
}

fn notifiers_for(account: &AccountConfig) -> NotifierSet {
    let mut notifiers: Vec<Box<dyn ReauthNotifier>> = Vec::new();
    if let Some(script) = &account.notification_script {
        notifiers.push(Box::new(ScriptNotifier::new(script.clone())));
    }
    if account.smtp.configured() {
        tracing::debug!(
            "SMTP notification configured for {:?}",
            account.smtp.to.as_deref().or(account.smtp.username.as_deref())
        );
    }
    NotifierSet::new(notifiers)
}

fn engine_options(global: &GlobalConfig, account: &AccountConfig) -> EngineOptions {
    EngineOptions {
        sizes: account.sizes.clone(),
        selector: SelectorOptions {
            force_size: account.force_size,
            align_raw: account.align_raw,
            skip_live_photos: account.skip_live_photos,
            live_photo_size: account.live_photo_size,
        },
        naming: NamingPolicy {
            directory: account.directory.clone().unwrap_or_default(),
            folder_structure: account.folder_structure.clone(),
            keep_unicode: account.keep_unicode_in_filenames,
            file_match_policy: account.file_match_policy,
            live_photo_mov_policy: account.live_photo_mov_filename_policy,
            use_os_locale: global.use_os_locale,
        },
        file_match_policy: account.file_match_policy,
        dry_run: account.dry_run,
        only_print_filenames: global.only_print_filenames,
        set_exif_datetime: account.set_exif_datetime,
        xmp_sidecar: account.xmp_sidecar,
    }
}

fn iteration_filter(account: &AccountConfig) -> IterationFilter {
    IterationFilter {
        skip_photos: account.skip_photos,
        skip_videos: account.skip_videos,
        skip_live_photos: account.skip_live_photos,
        skip_created_before: account.skip_created_before,
        skip_created_after: account.skip_created_after,
        recent: account.recent,
    }
}

/// Service query parameters shared by every call of a session.
fn service_params(client_id: String, dsid: Option<String>) -> HashMap<String, Value> {
    let mut params = HashMap::new();
    params.insert(
        "clientBuildNumber".to_string(),
        Value::String("2522Project44".to_string()),
    );
    params.insert(
        "clientMasteringNumber".to_string(),
        Value::String("2522B2".to_string()),
    );
    params.insert("clientId".to_string(), Value::String(client_id));
    if let Some(dsid) = dsid {
        params.insert("dsid".to_string(), Value::String(dsid));
    }
    params
}

async fn run_account(
    global: &GlobalConfig,
    account: &AccountConfig,
    cancel: &CancellationToken,
) -> SyncResult<()> {
    let credentials =
        ProviderChain::from_kinds(&global.password_providers, account.password.clone());
    let authenticator = Authenticator::new(
        account.username.clone(),
        global.domain,
        credentials,
        mfa_provider_for(global.mfa_provider),
    );
    let notifiers = notifiers_for(account);

    let session = Session::new(
        &account.cookie_directory,
        &account.username,
        authenticator.endpoints().home,
        None,
    )
    .await?;
    let shared: SharedSession = Arc::new(tokio::sync::RwLock::new(session));

    // INIT: authenticate, notifying when interactive re-auth is needed but
    // nobody can provide it.
    let data = {
        let mut session = shared.write().await;
        match authenticator.authenticate(&mut session).await {
            Ok(data) => data,
            Err(e @ (SyncError::MfaFailed(_) | SyncError::MfaRequired)) => {
                if !notifiers.is_empty() {
                    notifiers.notify_reauth_needed(&account.username).await;
                }
                return Err(e);
            }
            Err(e) => return Err(e),
        }
    };

    if account.auth_only {
        tracing::info!("Authentication completed successfully for {}", account.username);
        shared.read().await.flush().await?;
        return Ok(());
    }

    let service_root = data
        .ckdatabasews_url()
        .ok_or_else(|| SyncError::Service("account has no photos service endpoint".into()))?
        .to_string();
    let client_id = shared.read().await.client_id().cloned().unwrap_or_default();
    let params = service_params(client_id, data.dsid());
    let service = PhotosService::new(
        service_root,
        Box::new(Arc::clone(&shared)),
        params,
    )
    .await?;

    if account.list_libraries {
        println!("Private libraries:");
        for name in service.library_names("private").await? {
            println!("  {name}");
        }
        println!("Shared libraries:");
        for name in service.library_names("shared").await? {
            println!("  {name}");
        }
        return Ok(());
    }

    let library = service.library(&account.library).await?;

    if account.list_albums {
        let albums = library.albums().await?;
        println!("Albums:");
        let mut names: Vec<&String> = albums.keys().collect();
        names.sort();
        for name in names {
            println!("  {name}");
        }
        return Ok(());
    }

    // PASS / WAIT / re-auth cycle.
    let mut reauth_attempts = 0u32;
    let mut transient_failures = 0u32;
    loop {
        if cancel.is_cancelled() {
            break;
        }

        match run_pass(global, account, &authenticator, &shared, &library, cancel).await {
            Ok(stats) => {
                reauth_attempts = 0;
                transient_failures = 0;
                tracing::info!(
                    "Pass complete for {}: {} downloaded, {} already present, {} skipped, \
                     {} deleted remotely, {} deleted locally",
                    account.username,
                    stats.downloaded,
                    stats.existed,
                    stats.skipped_errors,
                    stats.remote_deleted,
                    stats.local_deleted,
                );
            }
            Err(SyncError::Cancelled) => break,
            Err(e) if e.requires_reauth() => {
                reauth_attempts += 1;
                if reauth_attempts > MAX_REAUTH_ATTEMPTS {
                    if !notifiers.is_empty() {
                        notifiers.notify_reauth_needed(&account.username).await;
                    }
                    return Err(SyncError::AuthFailed {
                        reason: format!(
                            "session expired {reauth_attempts} times, giving up"
                        ),
                    });
                }
                tracing::warn!(
                    "Session expired, re-authenticating ({}/{})",
                    reauth_attempts,
                    MAX_REAUTH_ATTEMPTS
                );
                let mut session = shared.write().await;
                match authenticator.authenticate(&mut session).await {
                    Ok(_) => {
                        tracing::info!("Re-authentication successful, resuming");
                        continue;
                    }
                    Err(e) => {
                        if !notifiers.is_empty() {
                            notifiers.notify_reauth_needed(&account.username).await;
                        }
                        return Err(e);
                    }
                }
            }
            Err(e) if e.is_retryable() => {
                transient_failures += 1;
                if global.watch_with_interval.is_none()
                    && transient_failures > MAX_TRANSIENT_FAILURES
                {
                    return Err(e);
                }
                let backoff = RetryConfig {
                    max_retries: MAX_TRANSIENT_FAILURES,
                    base_delay_secs: 10,
                    max_delay_secs: 300,
                }
                .delay_for(transient_failures.saturating_sub(1), &e);
                tracing::warn!(
                    "Transient failure ({}), waiting {}s: {}",
                    transient_failures,
                    backoff.as_secs(),
                    e
                );
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = cancel.cancelled() => break,
                }
                continue;
            }
            Err(e) => return Err(e),
        }

        let Some(interval) = global.watch_with_interval else {
            break;
        };
        let interval = interval.max(MIN_WATCH_INTERVAL_SECS);
        tracing::info!("Waiting {} seconds...", interval);
        tokio::select! {
            _ = tokio::time::sleep(std::time::Duration::from_secs(interval)) => {}
            _ = cancel.cancelled() => break,
        }
    }

    // Clean shutdown: persist the session for the next run.
    shared.read().await.flush().await?;
    Ok(())
}

/// One pass: iterate, reconcile, then realize deletions.
async fn run_pass(
    global: &GlobalConfig,
    account: &AccountConfig,
    authenticator: &Authenticator,
    shared: &SharedSession,
    library: &PhotoLibrary,
    cancel: &CancellationToken,
) -> SyncResult<PassStats> {
    let options = engine_options(global, account);
    let mode = account.delete_mode();

    let collections = if account.albums.is_empty() {
        vec![library.all()]
    } else {
        let mut available = library.albums().await?;
        let mut selected = Vec::with_capacity(account.albums.len());
        for name in &account.albums {
            match available.remove(name.as_str()) {
                Some(collection) => selected.push(collection),
                None => {
                    let mut names: Vec<&String> = available.keys().collect();
                    names.sort();
                    return Err(SyncError::Config(format!(
                        "album '{name}' not found; available albums: {names:?}"
                    )));
                }
            }
        }
        selected
    };

    let client = shared.read().await.download_client()?;
    let downloader = Downloader::new(
        client,
        RetryConfig {
            max_retries: account.max_retries,
            base_delay_secs: account.retry_delay_secs,
            max_delay_secs: 60,
        },
        cancel.clone(),
    );
    let observer: Arc<dyn SyncObserver> = Arc::new(NoopObserver);
    let engine = ReconcileEngine::new(options, downloader, observer);

    let mut stats = PassStats::default();
    let mut iter = AssetIterator::new(collections, iteration_filter(account));
    let mut consecutive_existing = 0u32;
    let mut remote_intents: Vec<RemoteDeleteIntent> = Vec::new();

    loop {
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        if let Some(limit) = account.until_found {
            if consecutive_existing >= limit {
                tracing::info!(
                    "Found {} consecutive previously downloaded assets, stopping",
                    limit
                );
                break;
            }
        }
        let Some(asset) = iter.next().await? else {
            break;
        };

        let outcome = engine.process_asset(&asset).await?;
        stats.downloaded += u64::from(outcome.downloaded);
        stats.existed += u64::from(outcome.existed);
        stats.skipped_errors += u64::from(outcome.skipped_errors);

        // until-found counts consecutive fully-present assets in yield
        // order; any missing target resets the run.
        if outcome.fully_existing() {
            consecutive_existing += 1;
        } else if outcome.missing_seen {
            consecutive_existing = 0;
        }

        if delete::wants_remote_delete(mode, &asset, outcome.downloaded > 0, Utc::now()) {
            remote_intents.push(RemoteDeleteIntent::for_asset(&asset));
        }
    }

    if global.only_print_filenames {
        return Ok(stats);
    }

    // Deletion phase. Remote intents are realized with one re-auth retry;
    // re-running the whole pass instead would lose delete-after-download
    // intents, since the second pass downloads nothing.
    if !remote_intents.is_empty() {
        let realized =
            match delete::realize_remote_deletes(library, &remote_intents, account.dry_run, cancel)
                .await
            {
                Ok(n) => n,
                Err(e) if e.requires_reauth() => {
                    tracing::warn!("Session expired during deletion, re-authenticating once");
                    {
                        let mut session = shared.write().await;
                        authenticator.authenticate(&mut session).await?;
                    }
                    delete::realize_remote_deletes(
                        library,
                        &remote_intents,
                        account.dry_run,
                        cancel,
                    )
                    .await?
                }
                Err(e) => return Err(e),
            };
        stats.remote_deleted += realized;
    }

    if mode == DeleteMode::AutoDelete {
        stats.local_deleted +=
            delete::autodelete_photos(library, engine.options(), account.dry_run, cancel).await?;
    }

    if let Some(directory) = &account.directory {
        if !account.dry_run && mode != DeleteMode::Copy {
            local::remove_empty_dirs(directory).await?;
        }
    }

    Ok(stats)
}
