//! Typed request/response shapes for the upstream RPC calls the Job Manager
//! actually uses, plus the conversion into the domain `BlockTemplate`.

use serde::{Deserialize, Serialize};

use kps_core::{BlockTemplate, TemplateTransaction};

use crate::error::RpcClientError;

/// `getblocktemplate` request parameters. Only `rules` is populated; we
/// don't request long-polling or capability negotiation.
#[derive(Debug, Clone, Serialize)]
pub struct BlockTemplateRequest {
    pub rules: Vec<String>,
}

impl Default for BlockTemplateRequest {
    fn default() -> Self {
        Self {
            rules: vec!["segwit".to_string()],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GetBlockTemplateResponse {
    pub height: u64,
    #[serde(rename = "previousblockhash")]
    pub previous_block_hash: String,
    pub bits: String,
    pub curtime: u32,
    pub mintime: u32,
    #[serde(rename = "coinbasevalue")]
    pub coinbase_value: u64,
    pub transactions: Vec<TemplateTransactionResponse>,
    pub default_witness_commitment: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TemplateTransactionResponse {
    pub data: String,
    pub txid: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ValidateAddressResponse {
    #[serde(rename = "isvalid")]
    pub is_valid: bool,
    pub address: String,
    #[serde(rename = "scriptPubKey")]
    pub script_pub_key: Option<String>,
}

impl GetBlockTemplateResponse {
    /// Convert the wire response into the domain `BlockTemplate`, parsing
    /// the hex fields and leaving the original JSON attached for anything
    /// this server doesn't model explicitly.
    pub fn into_template(self, raw: serde_json::Value) -> Result<BlockTemplate, RpcClientError> {
        let previous_block_hash = parse_hash(&self.previous_block_hash, "previousblockhash")?;
        let bits = parse_bits(&self.bits)?;

        let mut transactions = Vec::with_capacity(self.transactions.len());
        for tx in self.transactions {
            let data = hex::decode(&tx.data).map_err(|source| field_error("transactions[].data", source))?;
            let txid = parse_hash(&tx.txid, "transactions[].txid")?;
            transactions.push(TemplateTransaction { data, txid });
        }

        let witness_commitment = self
            .default_witness_commitment
            .map(|s| hex::decode(&s))
            .transpose()
            .map_err(|source| field_error("default_witness_commitment", source))?;

        Ok(BlockTemplate {
            height: self.height,
            previous_block_hash,
            bits,
            curtime: self.curtime,
            mintime: self.mintime,
            coinbase_value: self.coinbase_value,
            transactions,
            witness_commitment,
            raw: Some(raw),
            received_at: std::time::Instant::now(),
        })
    }
}

fn field_error(field: &'static str, source: hex::FromHexError) -> RpcClientError {
    RpcClientError::InvalidField {
        method: "getblocktemplate".to_string(),
        field,
        reason: source.to_string(),
    }
}

fn parse_hash(hex_str: &str, field: &'static str) -> Result<kps_core::Hash, RpcClientError> {
    let bytes = hex::decode(hex_str).map_err(|source| field_error(field, source))?;
    if bytes.len() != 32 {
        return Err(RpcClientError::InvalidField {
            method: "getblocktemplate".to_string(),
            field,
            reason: format!("must be 32 bytes, got {}", bytes.len()),
        });
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}

fn parse_bits(hex_str: &str) -> Result<u32, RpcClientError> {
    u32::from_str_radix(hex_str, 16).map_err(|_| RpcClientError::InvalidField {
        method: "getblocktemplate".to_string(),
        field: "bits",
        reason: format!("invalid hex: {hex_str}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_template() {
        let response = GetBlockTemplateResponse {
            height: 100,
            previous_block_hash: "11".repeat(32),
            bits: "1e00ffff".to_string(),
            curtime: 1_700_000_000,
            mintime: 1_699_999_000,
            coinbase_value: 500_000_000,
            transactions: vec![TemplateTransactionResponse {
                data: "deadbeef".to_string(),
                txid: "22".repeat(32),
            }],
            default_witness_commitment: None,
        };
        let template = response.into_template(serde_json::json!({})).unwrap();
        assert_eq!(template.height, 100);
        assert_eq!(template.bits, 0x1e00ffff);
        assert_eq!(template.transactions.len(), 1);
        assert_eq!(template.transactions[0].data, vec![0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn rejects_malformed_hash_length() {
        let response = GetBlockTemplateResponse {
            height: 1,
            previous_block_hash: "11".repeat(31),
            bits: "1e00ffff".to_string(),
            curtime: 0,
            mintime: 0,
            coinbase_value: 0,
            transactions: vec![],
            default_witness_commitment: None,
        };
        assert!(response.into_template(serde_json::json!({})).is_err());
    }
}
