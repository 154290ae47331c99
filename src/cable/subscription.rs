//! A client's view of one logical channel: typed action callbacks over an
//! otherwise-untyped JSON payload, plus the buffering needed while the
//! server hasn't confirmed the subscription yet.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use cable_protocol::{OutgoingFrame, SubscriptionIdentifier};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::error::CableError;
use super::handle::ClientHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Pending,
    Subscribed,
    Rejected,
    Unsubscribed,
}

/// Implemented by the payload type passed to
/// [`Subscription::register_acknowledgeable_callback`] so the dispatcher can
/// recover the id to echo back in the `acknowledge` message.
pub trait WithMessageId {
    fn message_id(&self) -> &str;
}

/// Details attached to a failed `acknowledge`.
#[derive(Debug, Clone)]
pub struct AcknowledgeError {
    pub message: String,
    pub stack_trace: Option<String>,
}

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type Handler = Box<dyn Fn(Value) -> BoxFuture + Send + Sync>;

struct QueuedAction {
    action_name: String,
    payload: Value,
}

/// One-shot callback handed to an acknowledgeable handler. The first call
/// to [`Acknowledge::acknowledge`] wins; later calls are no-ops, matching
/// the "calling acknowledge more than once is a no-op" rule.
pub struct Acknowledge {
    message_id: String,
    called: Arc<AtomicBool>,
    handle: Arc<ClientHandle>,
    identifier: String,
}

impl Acknowledge {
    pub async fn acknowledge(self, error: Option<AcknowledgeError>) {
        if self.called.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut payload = serde_json::Map::new();
        payload.insert("action".to_owned(), Value::String("acknowledge".to_owned()));
        payload.insert("message_id".to_owned(), Value::String(self.message_id));
        payload.insert("success".to_owned(), Value::Bool(error.is_none()));
        if let Some(err) = error {
            payload.insert("error_message".to_owned(), Value::String(err.message));
            if let Some(stack) = err.stack_trace {
                payload.insert("stack_trace".to_owned(), Value::String(stack));
            }
        }
        let data = Value::Object(payload);
        if let Err(e) = self
            .handle
            .guarantee_perform(CancellationToken::new(), self.identifier, data)
            .await
        {
            tracing::warn!(error = %e, "failed to deliver acknowledge message");
        }
    }
}

pub struct Subscription {
    identifier: SubscriptionIdentifier,
    handle: Arc<ClientHandle>,
    state: Mutex<SubscriptionState>,
    handlers: Mutex<HashMap<String, Handler>>,
    queued: Mutex<Vec<QueuedAction>>,
}

impl Subscription {
    pub(crate) fn new(identifier: SubscriptionIdentifier, handle: Arc<ClientHandle>) -> Arc<Self> {
        Arc::new(Subscription {
            identifier,
            handle,
            state: Mutex::new(SubscriptionState::Pending),
            handlers: Mutex::new(HashMap::new()),
            queued: Mutex::new(Vec::new()),
        })
    }

    pub fn identifier(&self) -> &SubscriptionIdentifier {
        &self.identifier
    }

    pub fn state(&self) -> SubscriptionState {
        *self.state.lock().unwrap()
    }

    /// Associate `action_name` with a typed handler. Payloads that fail to
    /// decode as `T` are logged and dropped rather than panicking the
    /// dispatch loop.
    pub fn register_callback<T, H, Fut>(&self, action_name: impl Into<String>, handler: H)
    where
        T: DeserializeOwned + Send + 'static,
        H: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let boxed: Handler = Box::new(move |value: Value| match serde_json::from_value::<T>(value) {
            Ok(typed) => Box::pin(handler(typed)) as BoxFuture,
            Err(e) => {
                tracing::warn!(error = %e, "failed to decode subscription message payload");
                Box::pin(async {})
            }
        });
        self.handlers.lock().unwrap().insert(action_name.into(), boxed);
    }

    /// Like `register_callback`, but the handler also receives an
    /// `Acknowledge` it must resolve exactly once via `guarantee_perform`.
    pub fn register_acknowledgeable_callback<T, H, Fut>(&self, action_name: impl Into<String>, handler: H)
    where
        T: DeserializeOwned + WithMessageId + Send + 'static,
        H: Fn(T, Acknowledge) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let identifier = self.identifier.encode();
        let handle = self.handle.clone();
        let boxed: Handler = Box::new(move |value: Value| {
            let identifier = identifier.clone();
            let handle = handle.clone();
            match serde_json::from_value::<T>(value) {
                Ok(typed) => {
                    let ack = Acknowledge {
                        message_id: typed.message_id().to_owned(),
                        called: Arc::new(AtomicBool::new(false)),
                        handle,
                        identifier,
                    };
                    Box::pin(handler(typed, ack)) as BoxFuture
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to decode acknowledgeable subscription message");
                    Box::pin(async {})
                }
            }
        });
        self.handlers.lock().unwrap().insert(action_name.into(), boxed);
    }

    /// `send_message("message", identifier, {action, ...args})`, buffered
    /// while `Pending` and flushed in order once `Subscribed`.
    pub async fn perform<T: Serialize>(&self, action_name: &str, args: &T) -> Result<(), CableError> {
        let mut fields = match serde_json::to_value(args)? {
            Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        let mut data = serde_json::Map::new();
        data.insert("action".to_owned(), Value::String(action_name.to_owned()));
        data.append(&mut fields);
        self.send_or_queue(action_name.to_owned(), Value::Object(data)).await
    }

    async fn send_or_queue(&self, action_name: String, data: Value) -> Result<(), CableError> {
        let state = *self.state.lock().unwrap();
        match state {
            SubscriptionState::Subscribed => {
                self.handle
                    .send_message(CancellationToken::new(), &self.identifier.encode(), data)
                    .await
            }
            SubscriptionState::Pending => {
                self.queued.lock().unwrap().push(QueuedAction { action_name, payload: data });
                Ok(())
            }
            SubscriptionState::Rejected | SubscriptionState::Unsubscribed => {
                Err(CableError::SubscriptionRejected)
            }
        }
    }

    pub async fn unsubscribe(&self) -> Result<(), CableError> {
        *self.state.lock().unwrap() = SubscriptionState::Unsubscribed;
        self.queued.lock().unwrap().clear();
        self.handle
            .send_frame(CancellationToken::new(), OutgoingFrame::unsubscribe(self.identifier.encode()))
            .await
    }

    /// Called by the client actor on `confirm_subscription`.
    pub(crate) async fn mark_subscribed(&self) {
        *self.state.lock().unwrap() = SubscriptionState::Subscribed;
        let queued: Vec<QueuedAction> = std::mem::take(&mut *self.queued.lock().unwrap());
        for action in queued {
            if let Err(e) = self
                .handle
                .send_message(CancellationToken::new(), &self.identifier.encode(), action.payload)
                .await
            {
                tracing::warn!(action = %action.action_name, error = %e, "failed to flush queued subscription action");
            }
        }
    }

    /// Called by the client actor on `reject_subscription`.
    pub(crate) fn mark_rejected(&self) {
        *self.state.lock().unwrap() = SubscriptionState::Rejected;
        self.queued.lock().unwrap().clear();
    }

    /// Called by the client actor when a `message` frame's identifier
    /// matches this subscription; message callbacks fire only in
    /// `Subscribed`.
    pub(crate) async fn dispatch_message(&self, data: Value) {
        let Some(action) = data.get("action").and_then(Value::as_str).map(str::to_owned) else {
            tracing::debug!("dropping subscription message with no action field");
            return;
        };
        if *self.state.lock().unwrap() != SubscriptionState::Subscribed {
            tracing::debug!(action = %action, "dropping message; subscription not subscribed");
            return;
        }
        let fut = {
            let handlers = self.handlers.lock().unwrap();
            handlers.get(&action).map(|handler| handler(data))
        };
        match fut {
            Some(fut) => fut.await,
            None => tracing::debug!(action = %action, "no handler registered for action"),
        }
    }
}
