use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{Sink, SinkExt};
use pgwire::api::auth::{
    finish_authentication, protocol_negotiation, save_startup_parameters_to_metadata,
    DefaultServerParameterProvider, StartupHandler,
};
use pgwire::api::{ClientInfo, PgWireConnectionState, METADATA_USER};
use pgwire::error::{PgWireError, PgWireResult};
use pgwire::messages::startup::Authentication;
use pgwire::messages::{PgWireBackendMessage, PgWireFrontendMessage};
use ulid::Ulid;

use crate::credential::constant_time_eq;
use crate::engine::Engine;

/// Connection metadata key holding the authenticated account id. Absent on
/// anonymous connections.
pub const ACCOUNT_KEY: &str = "labbook.account";

/// Who a login attempt turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Login {
    Account(Ulid),
    Anonymous,
}

/// Decide a login from the startup user name and the cleartext password.
///
/// A name that belongs to an account must present that account's own
/// password. Any other name connects anonymously with the shared public
/// token.
pub fn check_login(engine: &Engine, user: &str, password: &str, public_token: &str) -> Option<Login> {
    if engine.is_registered(user) {
        return engine
            .authenticate(user, password)
            .map(|actor| Login::Account(actor.id));
    }
    constant_time_eq(password.as_bytes(), public_token.as_bytes()).then_some(Login::Anonymous)
}

/// Cleartext-password startup that resolves the account at login time, so
/// a connection keeps the identity it authenticated with.
pub struct LabbookStartupHandler {
    engine: Arc<Engine>,
    public_token: String,
    parameter_provider: DefaultServerParameterProvider,
}

impl LabbookStartupHandler {
    pub fn new(engine: Arc<Engine>, public_token: String) -> Self {
        Self {
            engine,
            public_token,
            parameter_provider: DefaultServerParameterProvider::default(),
        }
    }
}

#[async_trait]
impl StartupHandler for LabbookStartupHandler {
    async fn on_startup<C>(&self, client: &mut C, message: PgWireFrontendMessage) -> PgWireResult<()>
    where
        C: ClientInfo + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<<C as Sink<PgWireBackendMessage>>::Error>,
    {
        match message {
            PgWireFrontendMessage::Startup(ref startup) => {
                protocol_negotiation(client, startup).await?;
                save_startup_parameters_to_metadata(client, startup);
                // Startup parameters are client-controlled.
                client.metadata_mut().remove(ACCOUNT_KEY);
                client.set_state(PgWireConnectionState::AuthenticationInProgress);
                client
                    .send(PgWireBackendMessage::Authentication(
                        Authentication::CleartextPassword,
                    ))
                    .await?;
            }
            PgWireFrontendMessage::PasswordMessageFamily(pwd) => {
                let pwd = pwd.into_password()?;
                let user = client.metadata().get(METADATA_USER).cloned().unwrap_or_default();
                match check_login(&self.engine, &user, &pwd.password, &self.public_token) {
                    Some(Login::Account(id)) => {
                        tracing::debug!("{user} authenticated as account {id}");
                        client.metadata_mut().insert(ACCOUNT_KEY.to_string(), id.to_string());
                    }
                    Some(Login::Anonymous) => {
                        tracing::debug!("{user} connected anonymously");
                    }
                    None => {
                        tracing::info!("failed login for {user:?}");
                        return Err(PgWireError::InvalidPassword(user));
                    }
                }
                finish_authentication(client, &self.parameter_provider).await?;
            }
            _ => {}
        }
        Ok(())
    }
}
