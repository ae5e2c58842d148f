//! Remote command execution through the gateway, used to read file contents for display.
//! Arguments are passed as a list; no shell string is built on this side.

use crate::gateway::{ClientError, ExecParams, ExecResult, GatewayRequester, METHOD_GATEWAY_EXEC};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecError {
    /// The command wrote to stderr instead of producing output.
    #[error("remote command failed: {0}")]
    Stderr(String),
    /// Neither stdout nor stderr came back.
    #[error("remote command returned no output")]
    Empty,
    /// The exec request itself failed.
    #[error(transparent)]
    Request(#[from] ClientError),
}

/// Run `command args...` on the gateway host. Returns stdout; a non-empty stderr
/// without stdout is an error.
pub async fn exec<R: GatewayRequester + ?Sized>(
    requester: &R,
    command: &str,
    args: &[String],
) -> Result<String, ExecError> {
    let params = ExecParams {
        command: command.to_string(),
        args: args.to_vec(),
    };
    let params = serde_json::to_value(params)
        .map_err(|e| ClientError::MalformedFrame(e.to_string()))?;
    let raw = requester.request(METHOD_GATEWAY_EXEC, params).await?;
    let result: ExecResult = serde_json::from_value(raw).unwrap_or_default();
    match (result.stdout, result.stderr) {
        (Some(stdout), _) => Ok(stdout),
        (None, Some(stderr)) if !stderr.is_empty() => Err(ExecError::Stderr(stderr)),
        _ => Err(ExecError::Empty),
    }
}

/// Read a file on the gateway host with `cat`.
pub async fn read_remote_file<R: GatewayRequester + ?Sized>(
    requester: &R,
    path: &str,
) -> Result<String, ExecError> {
    exec(requester, "cat", &[path.to_string()]).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::sync::Mutex;

    struct Canned {
        reply: Result<Value, ClientError>,
        seen: Mutex<Vec<(String, Value)>>,
    }

    #[async_trait::async_trait]
    impl GatewayRequester for Canned {
        async fn request(&self, method: &str, params: Value) -> Result<Value, ClientError> {
            self.seen
                .lock()
                .unwrap()
                .push((method.to_string(), params));
            self.reply.clone()
        }
    }

    fn canned(reply: Result<Value, ClientError>) -> Canned {
        Canned {
            reply,
            seen: Mutex::new(Vec::new()),
        }
    }

    #[tokio::test]
    async fn cat_returns_stdout() {
        let gw = canned(Ok(json!({ "stdout": "package main\n" })));
        let body = read_remote_file(&gw, "/src/auth.go").await.unwrap();
        assert_eq!(body, "package main\n");
        let seen = gw.seen.lock().unwrap();
        assert_eq!(seen[0].0, "gateway.exec");
        assert_eq!(seen[0].1, json!({ "command": "cat", "args": ["/src/auth.go"] }));
    }

    #[tokio::test]
    async fn stderr_and_empty_results_are_errors() {
        let gw = canned(Ok(json!({ "stderr": "cat: nope: No such file or directory" })));
        assert!(matches!(
            read_remote_file(&gw, "nope").await,
            Err(ExecError::Stderr(_))
        ));

        let gw = canned(Ok(json!({})));
        assert_eq!(read_remote_file(&gw, "x").await, Err(ExecError::Empty));
    }

    #[tokio::test]
    async fn request_failure_is_propagated() {
        let gw = canned(Err(ClientError::NotConnected));
        assert_eq!(
            read_remote_file(&gw, "x").await,
            Err(ExecError::Request(ClientError::NotConnected))
        );
    }
}
