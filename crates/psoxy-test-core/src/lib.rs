//! Test harness for Psoxy deployments on AWS and GCP.
//!
//! This crate is the engine behind the `psoxy-test` CLI, providing:
//!
//! - Authenticated proxy calls (SigV4 on AWS, identity tokens on GCP)
//! - Optional RS256 identity JWTs signed by AWS KMS or GCP Cloud KMS
//! - Multi-step endpoint walks over built-in data source catalogs
//! - Bulk file round-trips through input/output buckets
//! - Webhook collection verification and async response polling
//! - Log retrieval from CloudWatch and Cloud Logging
//!
//! # Quick Start
//!
//! ```no_run
//! use psoxy_test_core::{Catalog, CallOptions, ProxyClient, Transport};
//!
//! # async fn example() -> psoxy_test_core::HarnessResult<()> {
//! let client = ProxyClient::new(Transport::default(), Catalog::builtin()?);
//! let options = CallOptions::new("https://psoxy-gcal-abc123-uc.a.run.app/calendar/v3/users/me/settings")?;
//!
//! let response = client.call(&options).await?;
//! println!("{}", response.status_message());
//! # Ok(())
//! # }
//! ```
//!
//! # Credentials
//!
//! | Provider | Source |
//! |----------|--------|
//! | AWS | environment, `~/.aws/config` and `~/.aws/credentials` (`AWS_PROFILE`), web identity, container credentials, instance metadata; `--role` assumes a role through STS |
//! | GCP | identity: `--token`, else `gcloud auth print-identity-token`; access (GCS, KMS, Logging, Scheduler): always `gcloud auth print-access-token` |

pub mod accessor;
pub mod bulk;
pub mod catalog;
pub mod credentials;
pub mod error;
pub mod jwt;
pub mod location;
pub mod logs;
pub mod provider;
pub mod resolver;
pub mod response;
pub mod retry;
pub mod sigv4;
pub mod storage;
pub mod transport;
pub mod types;
pub mod verify;
mod xml;

// Re-export main types
pub use accessor::Accessor;
pub use bulk::{run_upload, FileDiff, RoundTrip};
pub use catalog::{Catalog, DataSource, EndpointSpec};
pub use credentials::{AwsCredentialProvider, AwsCredentials, GcpTokenSource};
pub use error::{HarnessError, HarnessResult};
pub use location::{poll_async_response, ObjectLocation, ASYNC_POLICY};
pub use logs::{LogEvent, LogReport};
pub use provider::aws::AwsLogsOptions;
pub use provider::gcp::GcpLogsOptions;
pub use provider::{CloudEndpoints, ProxyClient};
pub use resolver::run_data_source;
pub use response::{Diagnosis, ProxyErrorKind, ProxyResponse};
pub use retry::{execute_with_retry, RetryError, RetryPolicy};
pub use storage::{BucketStore, StorageBackend, StoredObject};
pub use transport::{Transport, TransportFailure};
pub use types::{
    BucketLocation, CallOptions, Provider, SigningKeyRef, UploadOptions, VerifyOptions,
    DEFAULT_REQUEST_TIMEOUT,
};
pub use verify::{verify_collection, MatchKind, VerifiedObject};
