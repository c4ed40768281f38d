use super::args::*;

pub mod call;
pub mod logs;
pub mod upload;

use psoxy_test_core::{Catalog, HarnessError, ProxyClient, Transport};
use std::time::Duration;

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;

pub async fn dispatch(cli: Cli) -> anyhow::Result<i32> {
    match cli.cmd {
        Command::Call(args) => call::run(args, cli.verbose).await,
        Command::Upload(args) => upload::run(args).await,
        Command::Logs(args) => logs::run(args).await,
    }
}

/// Exit code carried by a core error anywhere in the chain, else 1.
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<HarnessError>())
        .map(HarnessError::exit_code)
        .unwrap_or(EXIT_FAILURE)
}

pub(crate) fn build_client(timeout: Duration) -> anyhow::Result<ProxyClient> {
    let transport = Transport::new(timeout)?;
    Ok(ProxyClient::new(transport, Catalog::builtin()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_exit_code_follows_core_error() {
        let err: anyhow::Error = HarnessError::UnknownDataSource {
            name: "myspace".into(),
        }
        .into();
        assert_eq!(exit_code_for(&err), 1);

        let err = Err::<(), _>(HarnessError::NotFoundAfterRetries {
            what: "out/file.csv".into(),
            attempts: 60,
        })
        .context("upload failed")
        .unwrap_err();
        assert_eq!(exit_code_for(&err), 4);

        assert_eq!(exit_code_for(&anyhow::anyhow!("plain")), EXIT_FAILURE);
    }
}
