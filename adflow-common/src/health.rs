//! Liveness of the worker's long-running loops.
//!
//! Each loop registers a component and must check in before its deadline. The
//! process is live only while every registered component has checked in recently;
//! a component that misses its deadline is reported as `Stalled`.
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use time::{Duration, OffsetDateTime};
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Registered, has not checked in yet.
    Starting,
    /// Checked in, must check in again before this instant.
    HealthyUntil(OffsetDateTime),
    /// Missed its deadline.
    Stalled,
}

impl ComponentStatus {
    fn at(self, now: OffsetDateTime) -> Self {
        match self {
            ComponentStatus::HealthyUntil(until) if until <= now => ComponentStatus::Stalled,
            status => status,
        }
    }

    fn is_healthy(&self) -> bool {
        matches!(self, ComponentStatus::HealthyUntil(_))
    }
}

#[derive(Default, Debug)]
pub struct HealthStatus {
    pub healthy: bool,
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    /// 200 when live, 500 otherwise. The body lists every component.
    fn into_response(self) -> Response {
        let code = if self.healthy {
            StatusCode::OK
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        (code, format!("{:?}", self.components)).into_response()
    }
}

struct CheckIn {
    component: String,
    status: ComponentStatus,
}

/// Moved into a registered loop so it can check in.
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    sender: mpsc::Sender<CheckIn>,
}

impl HealthHandle {
    /// Report healthy until now + deadline.
    pub async fn report_healthy(&self) {
        self.send(ComponentStatus::HealthyUntil(
            OffsetDateTime::now_utc() + self.deadline,
        ))
        .await
    }

    async fn send(&self, status: ComponentStatus) {
        let check_in = CheckIn {
            component: self.component.clone(),
            status,
        };
        if let Err(error) = self.sender.send(check_in).await {
            warn!(component = %self.component, "failed to report liveness: {}", error)
        }
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
    sender: mpsc::Sender<CheckIn>,
}

impl HealthRegistry {
    pub fn new(name: &str) -> Self {
        let (sender, mut receiver) = mpsc::channel::<CheckIn>(16);
        let components: Arc<RwLock<HashMap<String, ComponentStatus>>> = Default::default();

        let shared = components.clone();
        tokio::spawn(async move {
            while let Some(check_in) = receiver.recv().await {
                match shared.write() {
                    Ok(mut map) => {
                        map.insert(check_in.component, check_in.status);
                    }
                    Err(_) => warn!("poisoned liveness registry lock"),
                }
            }
        });

        Self {
            name: name.to_owned(),
            components,
            sender,
        }
    }

    pub async fn register(&self, component: String, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component,
            deadline,
            sender: self.sender.clone(),
        };
        handle.send(ComponentStatus::Starting).await;
        handle
    }

    /// Live when at least one component is registered and all of them checked in on
    /// time. Usable as an axum handler.
    pub fn get_status(&self) -> HealthStatus {
        let Ok(components) = self.components.read() else {
            warn!(registry = %self.name, "liveness check failed: poisoned lock");
            return HealthStatus::default();
        };

        let now = OffsetDateTime::now_utc();
        let components: HashMap<String, ComponentStatus> = components
            .iter()
            .map(|(name, status)| (name.clone(), status.at(now)))
            .collect();
        let healthy = !components.is_empty() && components.values().all(|s| s.is_healthy());

        if healthy {
            debug!(registry = %self.name, "liveness check ok");
        } else {
            warn!(registry = %self.name, ?components, "liveness check failed");
        }
        HealthStatus {
            healthy,
            components,
        }
    }
}
