use std::sync::Arc;

use serde::Deserialize;

use crate::{
    envelope::Envelope,
    messaging::port::{ChatClient, ClientFactory},
    Error, Result,
};

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct SenderConfig {
    pub enabled: bool,
    /// Credentials of the identity to send as (e.g. a second bot token).
    pub credentials: String,
}

/// Delivers through an alternate identity instead of the main client.
pub struct SenderStage {
    client: Arc<dyn ChatClient>,
}

impl SenderStage {
    /// One-time setup: open the alternate identity.
    pub async fn init(cfg: SenderConfig, factory: Option<&dyn ClientFactory>) -> Result<Self> {
        if cfg.credentials.trim().is_empty() {
            return Err(Error::Config("sender credentials are empty".to_string()));
        }
        let factory = factory
            .ok_or_else(|| Error::Config("no client factory for sender override".to_string()))?;
        let client = factory.connect(&cfg.credentials).await?;
        Ok(Self { client })
    }

    pub fn apply(&self, env: &mut Envelope) {
        env.client = self.client.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ChatId, MessageId};
    use crate::messaging::types::{SendOptions, SourceMessage};
    use crate::testing::{FakeClient, FakeFactory};

    #[tokio::test]
    async fn swaps_delivery_client() {
        let alt = Arc::new(FakeClient::default());
        let factory = FakeFactory::new(alt.clone());
        let stage = SenderStage::init(
            SenderConfig {
                enabled: true,
                credentials: "token-2".to_string(),
            },
            Some(&factory),
        )
        .await
        .unwrap();
        assert_eq!(factory.connected_with(), vec!["token-2"]);

        let main = Arc::new(FakeClient::default());
        let mut env = Envelope::new(SourceMessage::new(ChatId(1), MessageId(1), "x"), main.clone());
        stage.apply(&mut env);
        env.client
            .send_text(ChatId(9), "hi", &SendOptions::default())
            .await
            .unwrap();

        assert_eq!(alt.sent_texts(), vec!["hi"]);
        assert!(main.sent_texts().is_empty());
    }

    #[tokio::test]
    async fn init_fails_without_credentials() {
        let factory = FakeFactory::new(Arc::new(FakeClient::default()));
        let res = SenderStage::init(SenderConfig::default(), Some(&factory)).await;
        assert!(res.is_err());
    }
}
