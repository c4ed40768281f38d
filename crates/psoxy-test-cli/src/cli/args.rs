use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use psoxy_test_core::{Provider, SigningKeyRef};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "psoxy-test",
    version,
    about = "Test a Psoxy deployment on AWS or GCP: signed calls, bulk round-trips and logs",
    after_help = "Example calls:\n  \
        AWS: psoxy-test call -u https://url-to-psoxy-function/path-to-api -r arn:aws:iam::id:myRole\n  \
        GCP: psoxy-test call -u https://url-to-psoxy-function/path-to-api -t foo"
)]
pub struct Cli {
    /// Verbose output (debug logging, response headers)
    #[arg(short, long, global = true, env = "PSOXY_VERBOSE")]
    pub verbose: bool,

    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Call a proxy endpoint, or every endpoint of a data source
    Call(CallArgs),
    /// Upload a file to the input bucket and diff the sanitized output
    Upload(UploadArgs),
    /// Show the latest log events of a deployment
    Logs(LogsArgs),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum HttpMethod {
    #[value(name = "GET")]
    Get,
    #[value(name = "POST")]
    Post,
}

#[derive(clap::Args, Debug, Clone)]
pub struct CallArgs {
    /// URL to call
    #[arg(short, long, env = "PSOXY_URL")]
    pub url: String,

    /// Force deploy type: aws or gcp
    #[arg(short, long, env = "PSOXY_FORCE")]
    pub force: Option<Provider>,

    /// User to impersonate, needed for certain connectors
    #[arg(short, long, env = "PSOXY_IMPERSONATE")]
    pub impersonate: Option<String>,

    /// ARN of AWS role to assume; if omitted, the ambient AWS principal invokes the function directly
    #[arg(short, long, env = "PSOXY_ROLE")]
    pub role: Option<String>,

    /// AWS: region of your Psoxy instance
    #[arg(long, env = "PSOXY_REGION")]
    pub region: Option<String>,

    /// Save the response body to a timestamped JSON file
    #[arg(short, long)]
    pub save_to_file: bool,

    /// Directory for --save-to-file output
    #[arg(long, default_value = "responses")]
    pub output_dir: PathBuf,

    /// Skip sanitization rules, only works if function deployed in development mode
    #[arg(long)]
    pub skip: bool,

    /// GCP: identity token presented to the proxy; defaults to gcloud
    #[arg(short, long, env = "PSOXY_TOKEN")]
    pub token: Option<String>,

    /// Add gzip compression header ("-z false" to remove)
    #[arg(
        short = 'z',
        long,
        action = ArgAction::Set,
        num_args = 0..=1,
        default_value_t = true,
        default_missing_value = "true"
    )]
    pub gzip: bool,

    /// Health Check call: check Psoxy deploy is running
    #[arg(long)]
    pub health_check: bool,

    /// Signing key for identity JWTs (aws-kms:<arn> or gcp-kms:<key-id>)
    #[arg(long, env = "PSOXY_SIGNING_KEY")]
    pub signing_key: Option<SigningKeyRef>,

    /// Issuer of JWT (iss claim)
    #[arg(long, env = "PSOXY_IDENTITY_ISSUER")]
    pub identity_issuer: Option<String>,

    /// Subject (sub) claim of the JWT
    #[arg(long, env = "PSOXY_IDENTITY_SUBJECT")]
    pub identity_subject: Option<String>,

    /// Request 'No response body' back from proxy (tests side-output case)
    #[arg(long)]
    pub request_no_response: bool,

    /// Process request asynchronously (Prefer: respond-async)
    #[arg(long = "async")]
    pub async_processing: bool,

    /// Body to send in request (JSON string)
    #[arg(short, long)]
    pub body: Option<String>,

    /// Verify that the posted body appears in this bucket (GCS/S3)
    #[arg(long, env = "PSOXY_VERIFY_COLLECTION")]
    pub verify_collection: Option<String>,

    /// GCP: Cloud Scheduler job to trigger batch processing (projects/../jobs/..)
    #[arg(long, env = "PSOXY_SCHEDULER_JOB")]
    pub scheduler_job: Option<String>,

    /// Data source to test all available endpoints
    #[arg(short, long)]
    pub data_source: Option<String>,

    /// HTTP method used when calling URL
    #[arg(short, long, value_enum)]
    pub method: Option<HttpMethod>,

    /// Request timeout in seconds
    #[arg(long, default_value_t = 25)]
    pub timeout: u64,
}

#[derive(clap::Args, Debug, Clone)]
pub struct UploadArgs {
    /// Cloud hosting the buckets
    #[arg(short = 'd', long, default_value = "aws", env = "PSOXY_FORCE")]
    pub deploy: Provider,

    /// Path of the file to be processed
    #[arg(short, long)]
    pub file: PathBuf,

    /// Input bucket, optionally with a prefix (bucket/prefix)
    #[arg(short, long, env = "PSOXY_INPUT_BUCKET")]
    pub input: String,

    /// Output bucket, optionally with a prefix (bucket/prefix)
    #[arg(short, long, env = "PSOXY_OUTPUT_BUCKET")]
    pub output: String,

    /// AWS role to assume, use its ARN
    #[arg(short, long, env = "PSOXY_ROLE")]
    pub role: Option<String>,

    /// AWS region of the buckets (input/output)
    #[arg(long, env = "PSOXY_REGION")]
    pub region: Option<String>,

    /// Delete the sanitized file from the output bucket afterwards
    #[arg(long)]
    pub delete_output: bool,

    /// Save the sanitized file next to the original
    #[arg(long)]
    pub save_sanitized: bool,

    /// Download attempts before giving up
    #[arg(long, default_value_t = 60)]
    pub attempts: u32,

    /// Seconds between download attempts
    #[arg(long, default_value_t = 5)]
    pub delay: u64,
}

#[derive(clap::Args, Debug, Clone)]
pub struct LogsArgs {
    /// GCP: project that hosts the function
    #[arg(short, long, env = "PSOXY_PROJECT_ID", requires = "function_name")]
    pub project_id: Option<String>,

    /// GCP: name of the function (Gen1) or service (Gen2)
    #[arg(short, long, env = "PSOXY_FUNCTION_NAME", requires = "project_id")]
    pub function_name: Option<String>,

    /// AWS: log group to display
    #[arg(
        short,
        long = "log-group-name",
        env = "PSOXY_LOG_GROUP",
        conflicts_with = "project_id"
    )]
    pub log_group: Option<String>,

    /// AWS: ARN of IAM role to assume
    #[arg(short, long, env = "PSOXY_ROLE")]
    pub role: Option<String>,

    /// AWS: region of your Psoxy instance
    #[arg(long, env = "PSOXY_REGION")]
    pub region: Option<String>,

    /// GCP: function URL, used to link the console logs page
    #[arg(short, long, env = "PSOXY_URL")]
    pub url: Option<String>,
}
