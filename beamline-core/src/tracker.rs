//! Public tracking surface
//!
//! [`Tracker`] is an explicit, externally owned handle: construct one with
//! [`Tracker::new`], call [`Tracker::init`] once a tokio runtime is running,
//! and pass it by reference to callers. There is no global singleton.
//! `init` is safe to call again; a re-init updates the identity in place and
//! never spawns duplicate background tasks.
//!
//! `track` and its variants validate synchronously, then hand the record to
//! the intake buffer. They never block on disk or network and are safe to
//! call from any task or thread.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Map, Value};

use crate::config::TrackerConfig;
use crate::error::{Error, Result};
use crate::event::{merge_parameters, EventRecord};
use crate::intake::{run_logger, IntakeBuffer};
use crate::net::{fetch_channel, Clock, Connectivity, HttpTransport, SocketProbe, SystemClock, Transport};
use crate::queue::DurableQueue;
use crate::worker::DeliveryWorker;

/// Event type tracked by [`Tracker::track_load`].
pub const EVENT_LOAD: &str = "om_load";
/// Event type tracked by [`Tracker::track_revenue`].
pub const EVENT_REVENUE: &str = "om_revenue";
/// Event type tracked by [`Tracker::enable_push_notifications`].
pub const EVENT_PUSH_ENABLE: &str = "om_gcm_enable";
/// Event type tracked by [`Tracker::disable_push_notifications`].
pub const EVENT_PUSH_DISABLE: &str = "om_gcm_disable";

/// Identity the tracker stamps onto every event.
///
/// Multi-account identities format as comma-joined parallel lists, so a
/// single event can be tracked against several api-key/user pairs at once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    api_key: String,
    uid: String,
}

impl Identity {
    /// Identity for a single api-key/user pair.
    pub fn single(api_key: &str, uid: &str) -> Result<Self> {
        validate_api_key(api_key)?;
        validate_uid(uid)?;
        Ok(Self {
            api_key: api_key.to_string(),
            uid: uid.to_string(),
        })
    }

    /// Identity for multiple api-key/user pairs, joined in iteration order.
    pub fn multi<I>(accounts: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut api_keys = Vec::new();
        let mut uids = Vec::new();
        for (api_key, uid) in accounts {
            validate_api_key(&api_key)?;
            validate_uid(&uid)?;
            api_keys.push(api_key);
            uids.push(uid);
        }
        if api_keys.is_empty() {
            return Err(Error::InvalidArgument(
                "at least one api-key/user pair is required".to_string(),
            ));
        }
        Ok(Self {
            api_key: api_keys.join(","),
            uid: uids.join(","),
        })
    }

    /// The formatted api-key field.
    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// The formatted uid field.
    pub fn uid(&self) -> &str {
        &self.uid
    }
}

fn validate_event_type(event_type: &str) -> Result<()> {
    if event_type.is_empty() {
        return Err(Error::InvalidArgument(
            "event type must not be empty".to_string(),
        ));
    }
    Ok(())
}

fn validate_api_key(api_key: &str) -> Result<()> {
    if api_key.is_empty() {
        return Err(Error::InvalidArgument(
            "api key must not be empty".to_string(),
        ));
    }
    Ok(())
}

fn validate_uid(uid: &str) -> Result<()> {
    if uid.is_empty() {
        return Err(Error::InvalidArgument(
            "user id must not be empty".to_string(),
        ));
    }
    Ok(())
}

/// The running pipeline, created by the first `init`.
struct Pipeline {
    identity: Identity,
    intake: IntakeBuffer,
    queue: Arc<DurableQueue>,
    clock: Arc<dyn Clock>,
}

struct Inner {
    config: TrackerConfig,
    http: reqwest::Client,
    pipeline: Mutex<Option<Pipeline>>,
}

/// Handle to the event tracking pipeline.
///
/// Cheap to clone; clones share the same pipeline.
#[derive(Clone)]
pub struct Tracker {
    inner: Arc<Inner>,
}

impl Tracker {
    /// Create an uninitialized tracker. Tracking calls fail with
    /// [`Error::Uninitialized`] until [`Tracker::init`] succeeds.
    pub fn new(config: TrackerConfig) -> Result<Self> {
        config.validate()?;

        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.endpoint.connect_timeout_secs))
            .timeout(Duration::from_secs(config.endpoint.read_timeout_secs))
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                http,
                pipeline: Mutex::new(None),
            }),
        })
    }

    /// Initialize the pipeline: open the durable queue and spawn the logger
    /// task and delivery worker. With `debug` set, events go to the debug
    /// endpoint host.
    ///
    /// Must be called within a tokio runtime. Calling `init` on an already
    /// initialized tracker only updates the identity.
    pub fn init(&self, identity: Identity, debug: bool) -> Result<()> {
        let endpoint = &self.inner.config.endpoint;
        let transport = HttpTransport::new(endpoint, debug)?;
        let connectivity = SocketProbe::new(endpoint.host(debug), endpoint.https);
        self.init_with(
            identity,
            Arc::new(transport),
            Arc::new(connectivity),
            Arc::new(SystemClock),
        )
    }

    /// Initialize with explicit transport, connectivity, and clock
    /// implementations. This is the injection seam for tests and for hosts
    /// with their own reachability signal.
    pub fn init_with(
        &self,
        identity: Identity,
        transport: Arc<dyn Transport>,
        connectivity: Arc<dyn Connectivity>,
        clock: Arc<dyn Clock>,
    ) -> Result<()> {
        let mut pipeline = self.inner.pipeline.lock().unwrap();

        if let Some(running) = pipeline.as_mut() {
            // Re-init: the tracker may outlive an application relaunch.
            // Refresh the identity, keep the running tasks.
            tracing::info!(api_key = identity.api_key(), "Re-initializing tracker");
            running.identity = identity;
            return Ok(());
        }

        tracing::info!(api_key = identity.api_key(), "Initializing tracker");

        let config = &self.inner.config;
        let queue = Arc::new(DurableQueue::open(
            &config.queue_path(),
            &config.storage.namespace,
            config.storage.corruption_policy,
        )?);

        let (intake, receiver) = IntakeBuffer::channel();
        tokio::spawn(run_logger(receiver, Arc::clone(&queue)));

        let worker = DeliveryWorker::new(
            Arc::clone(&queue),
            transport,
            connectivity,
            Arc::clone(&clock),
            config.delivery.clone(),
        );
        tokio::spawn(worker.run());

        *pipeline = Some(Pipeline {
            identity,
            intake,
            queue,
            clock,
        });
        Ok(())
    }

    /// Track an event with optional parameters.
    ///
    /// Validates synchronously; the record is then accepted for eventual
    /// delivery and cannot be lost short of storage failure. Never blocks on
    /// disk or network.
    pub fn track(&self, event_type: &str, parameters: Option<Map<String, Value>>) -> Result<()> {
        validate_event_type(event_type)?;

        let pipeline = self.inner.pipeline.lock().unwrap();
        let pipeline = pipeline.as_ref().ok_or(Error::Uninitialized)?;

        let record = EventRecord::new(
            event_type,
            parameters,
            pipeline.identity.api_key(),
            pipeline.identity.uid(),
            pipeline.clock.now_ms(),
        );
        pipeline.intake.push(record);
        Ok(())
    }

    /// Track a load event. Should be called on application start.
    ///
    /// Automatic platform parameters are merged under the caller's; a caller
    /// parameter with the same key wins.
    pub fn track_load(&self, parameters: Option<Map<String, Value>>) -> Result<()> {
        let merged = merge_parameters(automatic_parameters(), parameters.unwrap_or_default());
        self.track(EVENT_LOAD, Some(merged))
    }

    /// Track a revenue event.
    ///
    /// `currency_code` is a three-letter ISO-4217 code.
    pub fn track_revenue(
        &self,
        total: f64,
        currency_code: &str,
        additional: Option<Map<String, Value>>,
    ) -> Result<()> {
        if currency_code.is_empty() {
            return Err(Error::InvalidArgument(
                "currency code must not be empty".to_string(),
            ));
        }

        let mut parameters = additional.unwrap_or_default();
        parameters.insert("total".to_string(), Value::from(total));
        parameters.insert("currency_code".to_string(), Value::from(currency_code));
        self.track(EVENT_REVENUE, Some(parameters))
    }

    /// Track that push notifications were enabled for a registration id.
    pub fn enable_push_notifications(&self, registration_id: &str) -> Result<()> {
        let mut parameters = Map::new();
        parameters.insert(
            "om_registration_id".to_string(),
            Value::from(registration_id),
        );
        self.track(EVENT_PUSH_ENABLE, Some(parameters))
    }

    /// Track that push notifications were disabled.
    pub fn disable_push_notifications(&self) -> Result<()> {
        self.track(EVENT_PUSH_DISABLE, None)
    }

    /// Replace the user id used for subsequent events.
    pub fn set_user_id(&self, uid: &str) -> Result<()> {
        validate_uid(uid)?;
        let mut pipeline = self.inner.pipeline.lock().unwrap();
        let pipeline = pipeline.as_mut().ok_or(Error::Uninitialized)?;
        pipeline.identity.uid = uid.to_string();
        Ok(())
    }

    /// Replace the api key used for subsequent events.
    pub fn set_api_key(&self, api_key: &str) -> Result<()> {
        validate_api_key(api_key)?;
        let mut pipeline = self.inner.pipeline.lock().unwrap();
        let pipeline = pipeline.as_mut().ok_or(Error::Uninitialized)?;
        pipeline.identity.api_key = api_key.to_string();
        Ok(())
    }

    /// Fetch content for this user from a channel.
    pub async fn channel(&self, channel_id: u32) -> Result<Vec<Value>> {
        let (api_key, uid) = {
            let pipeline = self.inner.pipeline.lock().unwrap();
            let pipeline = pipeline.as_ref().ok_or(Error::Uninitialized)?;
            (
                pipeline.identity.api_key.clone(),
                pipeline.identity.uid.clone(),
            )
        };

        fetch_channel(
            &self.inner.http,
            &self.inner.config.endpoint.channel_url(),
            &api_key,
            &uid,
            channel_id,
        )
        .await
    }

    /// Number of accepted events not yet delivered.
    pub fn pending(&self) -> Result<u64> {
        let pipeline = self.inner.pipeline.lock().unwrap();
        let pipeline = pipeline.as_ref().ok_or(Error::Uninitialized)?;
        pipeline.queue.len()
    }

    /// Change the active log level.
    pub fn set_log_level(level: tracing::Level) -> Result<()> {
        crate::logging::set_level(level)
    }
}

/// Standard automatic parameters attached to load events.
fn automatic_parameters() -> Map<String, Value> {
    let mut parameters = Map::new();
    parameters.insert(
        "om_sdk_version".to_string(),
        Value::from(concat!("rust-", env!("CARGO_PKG_VERSION"))),
    );
    parameters.insert(
        "om_platform".to_string(),
        Value::from(std::env::consts::OS),
    );
    parameters.insert(
        "om_device".to_string(),
        Value::from(std::env::consts::ARCH),
    );
    if let Ok(locale) = std::env::var("LANG") {
        if !locale.is_empty() {
            parameters.insert("om_locale".to_string(), Value::from(locale));
        }
    }
    parameters
}
