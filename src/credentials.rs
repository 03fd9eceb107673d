// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Turning the credential parts of a [`ConnectionDescriptor`] into something
//! the S3 client can sign requests with.
//!
//! A connection string either carries a static key/secret, or relies on the
//! SDK's default provider chain. Either can be used as the base credentials
//! for assuming a role, in which case the temporary credentials are memoized
//! by [`MemoizedCredentials`] and only exchanged again once they expire.

use std::{
    fmt,
    sync::Arc,
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use aws_config::{sts::AssumeRoleProvider, BehaviorVersion, Region};
use aws_credential_types::{
    provider::{error::CredentialsError, future, ProvideCredentials, SharedCredentialsProvider},
    Credentials,
};
use thiserror::Error;

use crate::dsn::ConnectionDescriptor;

/// Session name used when assuming a role, unless overridden.
pub const DEFAULT_SESSION_NAME: &str = "assume_session";

const PROVIDER_NAME: &str = "ConnectionString";

/// How long before their expiry memoized credentials are exchanged again.
pub const DEFAULT_REFRESH_MARGIN: Duration = Duration::from_secs(5 * 60);

/// Error turning a connection string into credentials.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum CredentialError {
    /// The `assume` option is not an ARN.
    #[error("`assume` is not a valid role ARN ({arn}): {reason}")]
    InvalidRoleArn {
        /// The rejected value.
        arn: String,
        /// Why it was rejected.
        reason: String,
    },
    /// The default provider chain is not available, e.g. when built
    /// without the AWS default features.
    #[error("no credentials found by the default provider chain")]
    NoDefaultChain,
}

/// A failed exchange of base credentials for temporary ones.
#[derive(Error, Debug)]
#[error("credential exchange failed: {0}")]
pub struct ExchangeError(#[source] pub Box<dyn std::error::Error + Send + Sync>);

/// A key and secret taken verbatim from the connection string.
#[derive(Clone, PartialEq, Eq)]
pub struct StaticCredentials {
    key: String,
    secret: String,
}

impl StaticCredentials {
    /// Wraps an access key id and secret access key.
    pub fn new(key: impl Into<String>, secret: impl Into<String>) -> Self {
        StaticCredentials {
            key: key.into(),
            secret: secret.into(),
        }
    }

    /// The access key id.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The secret access key.
    pub fn secret(&self) -> &str {
        &self.secret
    }

    fn to_sdk(&self) -> Credentials {
        Credentials::new(&self.key, &self.secret, None, None, PROVIDER_NAME)
    }
}

impl fmt::Debug for StaticCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticCredentials")
            .field("key", &self.key)
            .field("secret", &"***")
            .finish()
    }
}

/// Credentials a role assumption can start from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BaseCredentials {
    /// Key and secret from the connection string.
    Static(StaticCredentials),
    /// Whatever the SDK's default chain finds.
    DefaultChain,
}

/// A role to assume, and what to assume it with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssumedRole {
    /// The role's ARN, from the `assume` option.
    pub role_arn: String,
    /// STS session name, [`DEFAULT_SESSION_NAME`] unless overridden.
    pub session_name: String,
    /// Credentials the `AssumeRole` call is signed with.
    pub base: BaseCredentials,
}

/// Where the storage client gets its credentials from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialSource {
    /// Key and secret from the connection string.
    Static(StaticCredentials),
    /// The SDK's environment/profile/instance discovery.
    DefaultChain,
    /// Temporary credentials for a role, exchanged through STS.
    AssumedRole(AssumedRole),
}

impl From<BaseCredentials> for CredentialSource {
    fn from(base: BaseCredentials) -> Self {
        match base {
            BaseCredentials::Static(credentials) => CredentialSource::Static(credentials),
            BaseCredentials::DefaultChain => CredentialSource::DefaultChain,
        }
    }
}

impl CredentialSource {
    /// Builds the provider the SDK will call. Only the assumed-role case
    /// touches the network, and only once the provider is first used.
    pub async fn provider(
        &self,
        region: &str,
    ) -> Result<SharedCredentialsProvider, CredentialError> {
        let region = Region::new(region.to_owned());
        match self {
            CredentialSource::Static(credentials) => {
                Ok(SharedCredentialsProvider::new(credentials.to_sdk()))
            }
            CredentialSource::DefaultChain => default_chain(&region).await,
            CredentialSource::AssumedRole(role) => {
                let base = match &role.base {
                    BaseCredentials::Static(credentials) => {
                        SharedCredentialsProvider::new(credentials.to_sdk())
                    }
                    BaseCredentials::DefaultChain => default_chain(&region).await?,
                };
                let exchange = StsRoleExchange::new(role, region, base).await;
                Ok(SharedCredentialsProvider::new(MemoizedCredentials::new(
                    exchange,
                )))
            }
        }
    }
}

async fn default_chain(region: &Region) -> Result<SharedCredentialsProvider, CredentialError> {
    aws_config::defaults(BehaviorVersion::latest())
        .region(region.clone())
        .load()
        .await
        .credentials_provider()
        .ok_or(CredentialError::NoDefaultChain)
}

/// Decides the [`CredentialSource`] for a connection string.
#[derive(Debug, Clone)]
pub struct CredentialResolver {
    session_name: String,
}

impl Default for CredentialResolver {
    fn default() -> Self {
        CredentialResolver {
            session_name: DEFAULT_SESSION_NAME.to_owned(),
        }
    }
}

impl CredentialResolver {
    /// Sets the session name used when assuming a role.
    pub fn with_session_name(mut self, session_name: impl Into<String>) -> Self {
        self.session_name = session_name.into();
        self
    }

    /// Pure: the same descriptor always resolves to an equal source.
    pub fn resolve(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<CredentialSource, CredentialError> {
        let base = match (descriptor.user(), descriptor.password()) {
            (Some(key), Some(secret)) => BaseCredentials::Static(StaticCredentials::new(key, secret)),
            _ => BaseCredentials::DefaultChain,
        };
        let Some(role_arn) = descriptor.assume() else {
            return Ok(base.into());
        };
        if let Err(e) = role_arn.parse::<aws_arn::ResourceName>() {
            return Err(CredentialError::InvalidRoleArn {
                arn: role_arn.to_owned(),
                reason: e.to_string(),
            });
        }
        Ok(CredentialSource::AssumedRole(AssumedRole {
            role_arn: role_arn.to_owned(),
            session_name: self.session_name.clone(),
            base,
        }))
    }
}

/// One live exchange of base credentials for temporary credentials.
#[async_trait]
pub trait CredentialExchange: fmt::Debug + Send + Sync {
    /// Performs the exchange. Called at most once per expiry by
    /// [`MemoizedCredentials`].
    async fn exchange(&self) -> Result<Credentials, ExchangeError>;
}

/// STS `AssumeRole` over some base credentials.
pub struct StsRoleExchange {
    role_arn: String,
    provider: AssumeRoleProvider,
}

impl StsRoleExchange {
    /// STS is reached through its regional endpoint, never through the
    /// storage endpoint override.
    pub async fn new(role: &AssumedRole, region: Region, base: SharedCredentialsProvider) -> Self {
        let provider = AssumeRoleProvider::builder(role.role_arn.clone())
            .session_name(role.session_name.clone())
            .region(region)
            .build_from_provider(base)
            .await;
        StsRoleExchange {
            role_arn: role.role_arn.clone(),
            provider,
        }
    }
}

impl fmt::Debug for StsRoleExchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StsRoleExchange")
            .field("role_arn", &self.role_arn)
            .finish()
    }
}

#[async_trait]
impl CredentialExchange for StsRoleExchange {
    async fn exchange(&self) -> Result<Credentials, ExchangeError> {
        tracing::debug!(message = "assuming role", role_arn = %self.role_arn);
        self.provider
            .provide_credentials()
            .await
            .map_err(|e| ExchangeError(Box::new(e)))
    }
}

/// Caches the result of a [`CredentialExchange`] until shortly before it
/// expires (see [`DEFAULT_REFRESH_MARGIN`]).
///
/// The cache lock is held across the exchange, so concurrent callers that
/// find the cache empty or expired wait for a single exchange instead of
/// each starting their own. Failed exchanges are not cached.
pub struct MemoizedCredentials<E> {
    exchange: E,
    cached: tokio::sync::Mutex<Option<Credentials>>,
    clock: Arc<dyn Fn() -> SystemTime + Send + Sync>,
    refresh_margin: Duration,
}

impl<E: CredentialExchange> MemoizedCredentials<E> {
    /// Memoizes `exchange`, with the wall clock and the default refresh margin.
    pub fn new(exchange: E) -> Self {
        MemoizedCredentials {
            exchange,
            cached: tokio::sync::Mutex::new(None),
            clock: Arc::new(SystemTime::now),
            refresh_margin: DEFAULT_REFRESH_MARGIN,
        }
    }

    /// Sets how long before expiry the credentials are exchanged again.
    pub fn with_refresh_margin(mut self, refresh_margin: Duration) -> Self {
        self.refresh_margin = refresh_margin;
        self
    }

    /// Replace the wall clock used for expiry checks.
    pub fn with_clock(mut self, clock: impl Fn() -> SystemTime + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// The cached credentials, or fresh ones if there are none or they are
    /// about to expire.
    pub async fn resolve(&self) -> Result<Credentials, ExchangeError> {
        let mut cached = self.cached.lock().await;
        if let Some(credentials) = cached.as_ref() {
            if !self.is_expired(credentials) {
                return Ok(credentials.clone());
            }
            tracing::debug!("memoized credentials expired, refreshing");
        }
        let fresh = self.exchange.exchange().await?;
        tracing::debug!(message = "exchanged credentials", expiry = ?fresh.expiry());
        *cached = Some(fresh.clone());
        Ok(fresh)
    }

    fn is_expired(&self, credentials: &Credentials) -> bool {
        credentials
            .expiry()
            .is_some_and(|expiry| (self.clock)() + self.refresh_margin >= expiry)
    }
}

impl<E: fmt::Debug> fmt::Debug for MemoizedCredentials<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoizedCredentials")
            .field("exchange", &self.exchange)
            .field("refresh_margin", &self.refresh_margin)
            .finish()
    }
}

impl<E: CredentialExchange + 'static> ProvideCredentials for MemoizedCredentials<E> {
    fn provide_credentials<'a>(&'a self) -> future::ProvideCredentials<'a>
    where
        Self: 'a,
    {
        future::ProvideCredentials::new(async move {
            self.resolve().await.map_err(CredentialsError::provider_error)
        })
    }
}
