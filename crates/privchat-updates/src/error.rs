use thiserror::Error;

/// 更新同步引擎错误
///
/// Gap / Duplicate / TooLong 都在引擎内部消化，不会以错误形式出现；
/// 这里只描述传输层、配置和服务句柄上的失败。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpdatesError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("RPC error [{code}]: {message}")]
    Rpc {
        code: i32,
        message: String,
    },

    #[error("Timeout: {0}")]
    Timeout(String),

    /// 响应结构不被支持（例如全局 differenceTooLong），按传输失败处理
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Config error: {0}")]
    Config(String),

    #[error("Shutting down: {0}")]
    ShuttingDown(String),

    #[error("JSON error: {0}")]
    JsonError(String),
}

impl From<serde_json::Error> for UpdatesError {
    fn from(error: serde_json::Error) -> Self {
        UpdatesError::JsonError(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, UpdatesError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = UpdatesError::Rpc {
            code: 420,
            message: "FLOOD_WAIT_3".to_string(),
        };
        assert_eq!(err.to_string(), "RPC error [420]: FLOOD_WAIT_3");
        assert_eq!(UpdatesError::NotConnected.to_string(), "Not connected");
    }

    #[test]
    fn test_from_serde_json() {
        let err: UpdatesError = serde_json::from_str::<u64>("nope").unwrap_err().into();
        assert!(matches!(err, UpdatesError::JsonError(_)));
    }
}
