//! Life-cycle event bus with revocable subscriptions.
//!
//! The host and loaded plugins observe plugin state changes exclusively
//! through this bus. Every subscription returns a [`SubscriptionHandle`];
//! subscriptions created by a plugin are tagged with that plugin's id so the
//! lifecycle manager can revoke all of them when the plugin is unloaded,
//! guaranteeing no dangling callbacks survive a teardown.

use std::fmt;

/// A notification emitted when a plugin changes life-cycle state.
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    PluginEnabled { id: String },
    PluginDisabled { id: String },
    PluginLoaded { id: String },
    PluginUnloaded { id: String },
    InstallProgress { id: String, percent: u8, message: String },
    PluginError { id: String, message: String },
}

impl LifecycleEvent {
    /// The id of the plugin this event concerns.
    pub fn plugin_id(&self) -> &str {
        match self {
            LifecycleEvent::PluginEnabled { id }
            | LifecycleEvent::PluginDisabled { id }
            | LifecycleEvent::PluginLoaded { id }
            | LifecycleEvent::PluginUnloaded { id }
            | LifecycleEvent::InstallProgress { id, .. }
            | LifecycleEvent::PluginError { id, .. } => id,
        }
    }
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleEvent::PluginEnabled { id } => write!(f, "enabled: {}", id),
            LifecycleEvent::PluginDisabled { id } => write!(f, "disabled: {}", id),
            LifecycleEvent::PluginLoaded { id } => write!(f, "loaded: {}", id),
            LifecycleEvent::PluginUnloaded { id } => write!(f, "unloaded: {}", id),
            LifecycleEvent::InstallProgress { id, percent, message } => {
                write!(f, "install {}: {}% {}", id, percent, message)
            }
            LifecycleEvent::PluginError { id, message } => {
                write!(f, "error in {}: {}", id, message)
            }
        }
    }
}

/// Opaque handle returned by [`EventBus::subscribe`]; pass it back to
/// [`EventBus::unsubscribe`] to revoke the callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

type EventCallback = Box<dyn Fn(&LifecycleEvent) + Send>;

struct Subscription {
    handle: SubscriptionHandle,
    /// Plugin id that created this subscription, if any. Host subscriptions
    /// have no owner and outlive every plugin.
    owner: Option<String>,
    callback: EventCallback,
}

/// Host-owned subscription registry and dispatcher.
#[derive(Default)]
pub struct EventBus {
    next_handle: u64,
    subscriptions: Vec<Subscription>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe on behalf of the host.
    pub fn subscribe<F>(&mut self, callback: F) -> SubscriptionHandle
    where
        F: Fn(&LifecycleEvent) + Send + 'static,
    {
        self.subscribe_inner(None, Box::new(callback))
    }

    /// Subscribe on behalf of a plugin. The handle is additionally revoked
    /// automatically when that plugin is unloaded.
    pub fn subscribe_owned<F>(&mut self, owner: &str, callback: F) -> SubscriptionHandle
    where
        F: Fn(&LifecycleEvent) + Send + 'static,
    {
        self.subscribe_inner(Some(owner.to_string()), Box::new(callback))
    }

    fn subscribe_inner(&mut self, owner: Option<String>, callback: EventCallback) -> SubscriptionHandle {
        self.next_handle += 1;
        let handle = SubscriptionHandle(self.next_handle);
        self.subscriptions.push(Subscription {
            handle,
            owner,
            callback,
        });
        handle
    }

    /// Revoke a single subscription. Returns true if the handle was live.
    pub fn unsubscribe(&mut self, handle: SubscriptionHandle) -> bool {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|s| s.handle != handle);
        self.subscriptions.len() != before
    }

    /// Revoke every subscription a plugin created. Returns how many were
    /// removed. Called by the lifecycle manager on the Unloaded transition.
    pub fn revoke_owned_by(&mut self, owner: &str) -> usize {
        let before = self.subscriptions.len();
        self.subscriptions
            .retain(|s| s.owner.as_deref() != Some(owner));
        let removed = before - self.subscriptions.len();
        if removed > 0 {
            log::debug!("revoked {} subscription(s) owned by {}", removed, owner);
        }
        removed
    }

    /// Dispatch an event to every live subscriber.
    pub fn emit(&self, event: &LifecycleEvent) {
        log::debug!("event: {}", event);
        for sub in &self.subscriptions {
            (sub.callback)(event);
        }
    }

    /// Number of live subscriptions (all owners).
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }
}
