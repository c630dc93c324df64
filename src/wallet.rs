//! 费用支付钱包加载。支持 JSON 字节数组、逗号分隔字节串
//! 和 base58 私钥三种格式。

use std::path::Path;

use solana_sdk::signature::Keypair;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("读取钱包文件 {path} 失败: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("钱包文件为空")]
    Empty,
    #[error("解析钱包字节失败: {0}")]
    Parse(String),
    #[error("私钥字节非法: {0}")]
    InvalidKey(String),
}

pub fn load_keypair(path: impl AsRef<Path>) -> Result<Keypair, WalletError> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path).map_err(|source| WalletError::Io {
        path: path.display().to_string(),
        source,
    })?;

    let keypair = parse_keypair(&contents)?;
    info!(
        target: "wallet",
        path = %path.display(),
        "钱包已加载"
    );
    Ok(keypair)
}

pub fn parse_keypair(raw: &str) -> Result<Keypair, WalletError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(WalletError::Empty);
    }

    let bytes: Vec<u8> = if trimmed.starts_with('[') {
        serde_json::from_str(trimmed).map_err(|err| WalletError::Parse(err.to_string()))?
    } else if trimmed.contains(',') {
        trimmed
            .split(',')
            .map(|part| part.trim())
            .filter(|part| !part.is_empty())
            .map(|part| part.parse::<u8>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| WalletError::Parse(err.to_string()))?
    } else {
        bs58::decode(trimmed)
            .into_vec()
            .map_err(|err| WalletError::Parse(err.to_string()))?
    };

    Keypair::try_from(bytes.as_slice()).map_err(|err| WalletError::InvalidKey(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use solana_sdk::signer::Signer;
    use std::io::Write;

    #[test]
    fn parses_json_byte_array() {
        let keypair = Keypair::new();
        let json = serde_json::to_string(&keypair.to_bytes().to_vec()).expect("json");
        let parsed = parse_keypair(&json).expect("parse");
        assert_eq!(parsed.pubkey(), keypair.pubkey());
    }

    #[test]
    fn parses_base58_string() {
        let keypair = Keypair::new();
        let encoded = bs58::encode(keypair.to_bytes()).into_string();
        let parsed = parse_keypair(&encoded).expect("parse");
        assert_eq!(parsed.pubkey(), keypair.pubkey());
    }

    #[test]
    fn rejects_empty_input() {
        assert!(matches!(parse_keypair("  "), Err(WalletError::Empty)));
    }

    #[test]
    fn loads_keypair_from_file() {
        let keypair = Keypair::new();
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        write!(
            file,
            "{}",
            serde_json::to_string(&keypair.to_bytes().to_vec()).expect("json")
        )
        .expect("write");

        let loaded = load_keypair(file.path()).expect("load");
        assert_eq!(loaded.pubkey(), keypair.pubkey());
    }
}
