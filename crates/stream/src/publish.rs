use crate::context::Context;
use crate::error::{Error, Result};
use crate::message::{Message, Metadata};
use crate::registry::Registry;

use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, warn};

impl Registry {
    /// Publishes one message on binding `name`.
    ///
    /// A publisher is created for the call and closed afterwards. Close
    /// failures are logged only.
    ///
    /// # Errors
    /// Configuration and provider errors from [`Registry::new_publisher`],
    /// and [`Error::Publish`] if the transport rejects the message.
    pub async fn publish(
        &self,
        ctx: &Context,
        name: &str,
        payload: impl Into<Bytes>,
        metadata: &Metadata,
    ) -> Result<()> {
        let binding = self.binding_configuration(name)?;
        let publisher = self.publisher_for(name, &binding).await?;

        let message = Message::new(payload)
            .with_metadata(metadata.clone())
            .with_context(ctx.clone());
        let message_id = message.id();

        let result = publisher
            .publish(message)
            .await
            .map_err(|source| Error::Publish {
                destination: binding.destination.clone(),
                source,
            });

        if let Err(err) = publisher.close().await {
            warn!(binding = name, error = %err, "failed to close publisher");
        }

        if result.is_ok() {
            debug!(
                binding = name,
                destination = %binding.destination,
                message_id = %message_id,
                "message published"
            );
        }
        result
    }

    /// Serializes `object` as JSON and publishes it on binding `name`.
    ///
    /// # Errors
    /// [`Error::Serialize`] if `object` cannot be serialized, otherwise as
    /// [`Registry::publish`].
    pub async fn publish_object<T>(
        &self,
        ctx: &Context,
        name: &str,
        object: &T,
        metadata: &Metadata,
    ) -> Result<()>
    where
        T: Serialize + ?Sized + Sync,
    {
        let payload = serde_json::to_vec(object)?;
        self.publish(ctx, name, payload, metadata).await
    }
}
