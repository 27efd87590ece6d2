//! The cache worker's event handlers.
//!
//! Install seeds the generation, activate purges every other generation,
//! fetch is network-first with a cache fallback. The host decides when each
//! handler runs; nothing here touches lifecycle state.

use futures::future::try_join_all;
use http::{Method, StatusCode};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use tvkit_common::{retry_with_backoff, with_timeout, RetryConfig, TvKitError};
use tvkit_net::{
    Fetcher, InterceptAction, NetError, Request, RequestInterceptor, Response, Url, UrlPattern,
};

use crate::cache::{CacheEntry, CacheKey, SharedCacheStorage};
use crate::config::WorkerConfig;
use crate::message::ControlMessage;
use crate::ServiceWorkerError;

/// Result of a successful install.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstallOutcome {
    /// Number of seed entries committed.
    pub seeded: usize,
    /// The worker asked to skip the waiting phase.
    pub skip_waiting: bool,
    /// Seeding failed but a stored generation of this version already held
    /// every seed asset, so it was kept as is.
    pub reused: bool,
}

/// What activation did to the cache storage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivationReport {
    /// Generation that stays.
    pub version: String,
    /// Stale generations deleted.
    pub purged: Vec<String>,
    /// Stale generations that could not be deleted after every attempt.
    pub leaked: Vec<String>,
    /// The worker asked to control every open page.
    pub claim: bool,
}

/// Where a response handed to the page came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    /// Eligible request, fresh from the network.
    Network,
    /// Network failed, served from the cache.
    Cache,
    /// Not eligible or not controlled; the network was used untouched.
    Passthrough,
}

/// Response delivered to a page.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub response: Response,
    pub source: ResponseSource,
}

/// Decision of the fetch handler.
#[derive(Debug)]
pub enum FetchOutcome {
    /// Not eligible. The host fetches from the network without caching.
    Passthrough,
    /// Network answered. `store` is set when the response should be cached.
    Network { response: Response, store: bool },
    /// Network failed, a cached response stands in.
    Cached(Response),
    /// Network failed and nothing was cached.
    Failed(NetError),
}

/// Handlers of one worker version.
pub struct CacheWorker {
    config: WorkerConfig,
    policy: RequestInterceptor,
    cleanup: RetryConfig,
    fetcher: Arc<dyn Fetcher>,
}

impl fmt::Debug for CacheWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheWorker")
            .field("version", &self.config.cache_version)
            .field("rules", &self.policy.rule_count())
            .finish_non_exhaustive()
    }
}

impl CacheWorker {
    pub fn new(config: WorkerConfig, fetcher: Arc<dyn Fetcher>) -> Self {
        let mut policy = RequestInterceptor::new();
        policy.only_method(Method::GET);
        policy.bypass(UrlPattern::path_contains(&config.admin_marker));
        policy.bypass(UrlPattern::path_contains(&config.api_marker));

        let cleanup = RetryConfig {
            initial_delay: Duration::from_millis(50),
            ..RetryConfig::default()
        }
        .with_attempts(config.cleanup_attempts);

        Self {
            config,
            policy,
            cleanup,
            fetcher,
        }
    }

    /// Version tag, also the name of the generation this worker owns.
    pub fn version(&self) -> &str {
        &self.config.cache_version
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Whether a request may be served from or written to the cache.
    pub fn is_eligible(&self, request: &Request) -> bool {
        self.policy.intercept(request) == InterceptAction::Handle
    }

    async fn fetch_network(&self, request: &Request) -> Result<Response, NetError> {
        let timeout = request.timeout.unwrap_or_else(|| self.config.network_timeout());
        match with_timeout(timeout, self.fetcher.fetch(request)).await {
            Ok(result) => result,
            Err(TvKitError::Timeout(after)) => Err(NetError::Timeout(after)),
            Err(e) => Err(NetError::RequestFailed(e.to_string())),
        }
    }

    /// Install: fetch every seed asset and commit them as one batch.
    ///
    /// Any failed or non-2xx seed aborts the install and nothing is written,
    /// unless a stored generation of this version (restored from disk) already
    /// holds every seed asset. That generation is then reused untouched.
    pub async fn on_install(
        &self,
        origin: &Url,
        caches: &SharedCacheStorage,
    ) -> Result<InstallOutcome, ServiceWorkerError> {
        let version = self.version();
        let install_error = |reason: String| ServiceWorkerError::InstallFailed {
            version: version.to_string(),
            reason,
        };

        let requests = self
            .config
            .seed_manifest
            .iter()
            .map(|path| {
                origin
                    .join(path)
                    .map(Request::get)
                    .map_err(|e| install_error(format!("bad seed path {path}: {e}")))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let fetched = try_join_all(requests.iter().map(|request| async move {
            let response = self
                .fetch_network(request)
                .await
                .map_err(|e| install_error(format!("{}: {e}", request.url)))?;
            if !response.ok() {
                return Err(install_error(format!(
                    "{}: status {}",
                    request.url, response.status
                )));
            }
            Ok(CacheEntry::from_response(request, &response))
        }))
        .await;

        let entries = match fetched {
            Ok(entries) => entries,
            Err(e) => {
                if !self.holds_seed(&requests, caches).await {
                    return Err(e);
                }
                warn!(version, error = %e, "Seeding failed, reusing stored generation");
                return Ok(InstallOutcome {
                    seeded: 0,
                    skip_waiting: self.config.skip_waiting_on_install,
                    reused: true,
                });
            }
        };

        let seeded = entries.len();
        caches
            .write()
            .await
            .put_all(version, entries)
            .await
            .map_err(|e| install_error(e.to_string()))?;

        info!(version, seeded, "Seed manifest cached");

        Ok(InstallOutcome {
            seeded,
            skip_waiting: self.config.skip_waiting_on_install,
            reused: false,
        })
    }

    async fn holds_seed(&self, seed: &[Request], caches: &SharedCacheStorage) -> bool {
        let storage = caches.read().await;
        storage.get(self.version()).is_some_and(|cache| {
            seed.iter()
                .all(|request| cache.match_key(&CacheKey::for_request(request)).is_some())
        })
    }

    /// Activate: delete every generation except this worker's own.
    ///
    /// Each deletion is retried with backoff. What still fails is reported
    /// as leaked; the next activation enumerates it again.
    pub async fn on_activate(&self, caches: &SharedCacheStorage) -> ActivationReport {
        let version = self.version().to_string();
        let stale: Vec<String> = caches
            .read()
            .await
            .keys()
            .into_iter()
            .filter(|name| *name != version)
            .collect();

        let mut report = ActivationReport {
            version: version.clone(),
            claim: self.config.claim_on_activate,
            ..Default::default()
        };

        for name in stale {
            let storage = Arc::clone(caches);
            let target = name.clone();
            let deleted = retry_with_backoff(&self.cleanup, || {
                let storage = Arc::clone(&storage);
                let target = target.clone();
                async move { storage.write().await.delete(&target).await }
            })
            .await;

            match deleted {
                Ok(_) => {
                    debug!(version = %version, stale = %name, "Purged stale generation");
                    report.purged.push(name);
                }
                Err(e) => {
                    warn!(version = %version, stale = %name, error = %e, "Stale generation leaked");
                    report.leaked.push(name);
                }
            }
        }

        info!(
            version = %version,
            purged = report.purged.len(),
            leaked = report.leaked.len(),
            "Activation cleanup finished"
        );

        report
    }

    /// Fetch: network first, cache on network failure.
    ///
    /// Ineligible requests are handed back untouched; they never read or
    /// write the cache.
    pub async fn on_fetch(&self, request: &Request, caches: &SharedCacheStorage) -> FetchOutcome {
        if !self.is_eligible(request) {
            debug!(url = %request.url, method = %request.method, "Bypassing cache");
            return FetchOutcome::Passthrough;
        }

        let error = match self.fetch_network(request).await {
            Ok(response) => {
                let store = response.status == StatusCode::OK;
                return FetchOutcome::Network { response, store };
            }
            Err(e) => e,
        };

        let key = CacheKey::for_request(request);
        let cached = caches
            .read()
            .await
            .match_request(&key)
            .map(CacheEntry::to_response);

        match cached {
            Some(Ok(response)) => {
                debug!(url = %request.url, error = %error, "Network failed, serving cached copy");
                FetchOutcome::Cached(response)
            }
            Some(Err(e)) => {
                warn!(url = %request.url, error = %e, "Cached copy unusable");
                FetchOutcome::Failed(error)
            }
            None => {
                debug!(url = %request.url, error = %error, "Network failed, nothing cached");
                FetchOutcome::Failed(error)
            }
        }
    }

    /// Write a response into this worker's generation.
    ///
    /// Returns `false` when the generation no longer exists, so a retired
    /// worker's late write cannot resurrect a purged generation.
    pub async fn store(
        &self,
        caches: &SharedCacheStorage,
        request: &Request,
        response: &Response,
    ) -> Result<bool, ServiceWorkerError> {
        let entry = CacheEntry::from_response(request, response);
        caches
            .write()
            .await
            .put_existing(self.version(), entry)
            .await
    }

    /// Message handler. Returns `true` when the worker asks to skip waiting.
    pub fn on_message(&self, message: ControlMessage) -> bool {
        match message {
            ControlMessage::SkipWaiting => {
                debug!(version = %self.version(), "Skip waiting requested");
                true
            }
        }
    }
}
