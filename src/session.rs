//! A connected deployment: one client and the dispatcher in front of it

use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

use crate::client::azure::AzureImageClient;
use crate::client::traits::{ClientConfig, ImageGenerator};
use crate::config::Settings;
use crate::error::{AppError, Result};
use crate::queue::{Dispatcher, DispatcherConfig, SharedBudget};

pub struct Session {
    id: Uuid,
    client_config: Option<ClientConfig>,
    dispatcher: Dispatcher,
    opened_at: DateTime<Utc>,
}

impl Session {
    /// Connect to an Azure deployment. Calls are paced by `budget`, which
    /// outlives the session.
    pub fn connect(
        client_config: ClientConfig,
        rpm: u32,
        settings: &Settings,
        budget: SharedBudget,
    ) -> Result<Self> {
        if rpm == 0 {
            return Err(AppError::Configuration(
                "RPM must be a positive integer".to_string(),
            ));
        }
        let client = AzureImageClient::new(client_config.clone(), settings.call_timeout())?;
        Ok(Self::with_generator(
            Arc::new(client),
            Some(client_config),
            settings.dispatcher_config(rpm),
            budget,
        ))
    }

    /// Build a session around any generator
    pub fn with_generator(
        generator: Arc<dyn ImageGenerator>,
        client_config: Option<ClientConfig>,
        dispatcher_config: DispatcherConfig,
        budget: SharedBudget,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            client_config,
            dispatcher: Dispatcher::with_budget(generator, dispatcher_config, budget),
            opened_at: Utc::now(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn client_config(&self) -> Option<&ClientConfig> {
        self.client_config.as_ref()
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }
}
