use crate::action::{BoxError, ListenerAction};
use crate::error::{Error, Result};
use crate::message::Message;

use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

/// Routes messages of one subscription to handlers by a metadata header.
pub struct MetadataDispatcher {
    actions: HashMap<String, ListenerAction>,
    header: String,
}

impl MetadataDispatcher {
    /// Creates a dispatcher keyed on the `header` metadata value.
    ///
    /// # Errors
    /// [`Error::HeaderNotSpecified`] for an empty header name and
    /// [`Error::ActionsNotSpecified`] for an empty action map.
    pub fn new(header: impl Into<String>, actions: HashMap<String, ListenerAction>) -> Result<Self> {
        let header = header.into();
        if header.is_empty() {
            return Err(Error::HeaderNotSpecified);
        }
        if actions.is_empty() {
            return Err(Error::ActionsNotSpecified);
        }

        Ok(Self { actions, header })
    }

    /// Invokes the action registered for the message's header value.
    ///
    /// Messages without the header, or with a value nobody handles, are
    /// logged and reported as handled.
    ///
    /// # Errors
    /// Whatever the selected action returns.
    pub async fn dispatch(&self, message: Message) -> std::result::Result<(), BoxError> {
        let Some(value) = message.metadata().get(&self.header) else {
            warn!(
                header = %self.header,
                message_id = %message.id(),
                "dispatch header missing, ignoring message"
            );
            return Ok(());
        };

        let Some(action) = self.actions.get(value) else {
            warn!(
                header = %self.header,
                value = %value,
                message_id = %message.id(),
                "no action for dispatch header value, ignoring message"
            );
            return Ok(());
        };

        action(message).await
    }

    /// Turns the dispatcher into a single listener action.
    #[must_use]
    pub fn into_action(self) -> ListenerAction {
        let dispatcher = Arc::new(self);
        Arc::new(move |message| {
            let dispatcher = dispatcher.clone();
            Box::pin(async move { dispatcher.dispatch(message).await })
        })
    }
}
