//! Core types used throughout the system
//!
//! Identifier aliases and the [`Blockchain`] enum shared by every module.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Merchant user ID (owner of stores, wallets and settings).
pub type UserId = uuid::Uuid;

/// Store ID - a merchant can own several stores, each with its own address pool.
pub type StoreId = uuid::Uuid;

/// Owner ID inside the processing engine.
///
/// Every user that may move funds has exactly one processing owner.
pub type OwnerId = uuid::Uuid;

/// Transfer ID - generated client side and reused as the engine idempotency key.
pub type TransferId = uuid::Uuid;

/// Currency ID, e.g. `BTC.Bitcoin` or `USDT.Tron`.
pub type CurrencyId = String;

/// Supported blockchains
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Blockchain {
    Bitcoin,
    Litecoin,
    #[serde(rename = "bitcoincash")]
    BitcoinCash,
    Dogecoin,
    Ethereum,
    #[serde(rename = "bsc")]
    BinanceSmartChain,
    Polygon,
    Arbitrum,
    Optimism,
    Tron,
}

const BECH32_CHARSET: &str = "qpzry9x8gf2tvdw0s3jn54khce6mua7l";

impl Blockchain {
    pub const ALL: [Blockchain; 10] = [
        Blockchain::Bitcoin,
        Blockchain::Litecoin,
        Blockchain::BitcoinCash,
        Blockchain::Dogecoin,
        Blockchain::Ethereum,
        Blockchain::BinanceSmartChain,
        Blockchain::Polygon,
        Blockchain::Arbitrum,
        Blockchain::Optimism,
        Blockchain::Tron,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Blockchain::Bitcoin => "bitcoin",
            Blockchain::Litecoin => "litecoin",
            Blockchain::BitcoinCash => "bitcoincash",
            Blockchain::Dogecoin => "dogecoin",
            Blockchain::Ethereum => "ethereum",
            Blockchain::BinanceSmartChain => "bsc",
            Blockchain::Polygon => "polygon",
            Blockchain::Arbitrum => "arbitrum",
            Blockchain::Optimism => "optimism",
            Blockchain::Tron => "tron",
        }
    }

    /// EVM chains share one address across all assets of the chain.
    #[inline]
    pub fn is_evm(&self) -> bool {
        matches!(
            self,
            Blockchain::Ethereum
                | Blockchain::BinanceSmartChain
                | Blockchain::Polygon
                | Blockchain::Arbitrum
                | Blockchain::Optimism
        )
    }

    /// UTXO chains are the ones where multi-address consolidation makes sense.
    #[inline]
    pub fn is_utxo(&self) -> bool {
        matches!(
            self,
            Blockchain::Bitcoin
                | Blockchain::Litecoin
                | Blockchain::BitcoinCash
                | Blockchain::Dogecoin
        )
    }

    /// Chains whose transfers are funded either by burning the native coin or
    /// by staked resources, so the engine needs an explicit kind.
    #[inline]
    pub fn requires_transfer_kind_hint(&self) -> bool {
        matches!(self, Blockchain::Tron)
    }

    /// Chains where hot wallet creation accepts an address format hint.
    #[inline]
    pub fn supports_address_type_hint(&self) -> bool {
        matches!(self, Blockchain::Bitcoin | Blockchain::Litecoin)
    }

    /// Address validation with checksums.
    ///
    /// Base58check payloads must carry one of the chain's version bytes,
    /// segwit addresses must decode with the chain's hrp, and mixed-case EVM
    /// addresses must match their EIP-55 checksum.
    pub fn is_valid_address(&self, address: &str) -> bool {
        match self {
            Blockchain::Bitcoin => {
                has_base58_version(address, &[0x00, 0x05]) || is_segwit(address, "bc")
            }
            Blockchain::Litecoin => {
                has_base58_version(address, &[0x30, 0x32, 0x05]) || is_segwit(address, "ltc")
            }
            Blockchain::BitcoinCash => {
                is_cash_address(address) || has_base58_version(address, &[0x00, 0x05])
            }
            Blockchain::Dogecoin => has_base58_version(address, &[0x1e, 0x16]),
            Blockchain::Tron => has_base58_version(address, &[0x41]),
            Blockchain::Ethereum
            | Blockchain::BinanceSmartChain
            | Blockchain::Polygon
            | Blockchain::Arbitrum
            | Blockchain::Optimism => is_evm_address(address),
        }
    }
}

/// Version byte plus a 20 byte hash, checksum verified
fn has_base58_version(address: &str, versions: &[u8]) -> bool {
    match bs58::decode(address).with_check(None).into_vec() {
        Ok(payload) => payload.len() == 21 && versions.contains(&payload[0]),
        Err(_) => false,
    }
}

fn is_segwit(address: &str, hrp: &str) -> bool {
    bech32::segwit::decode(address).is_ok_and(|(decoded, _, _)| decoded.to_lowercase() == hrp)
}

fn is_evm_address(address: &str) -> bool {
    let Some(body) = address.strip_prefix("0x") else {
        return false;
    };
    if body.len() != 40 || hex::decode(body).is_err() {
        return false;
    }
    let has_upper = body.chars().any(|c| c.is_ascii_uppercase());
    let has_lower = body.chars().any(|c| c.is_ascii_lowercase());
    !(has_upper && has_lower) || is_eip55_checksummed(body)
}

fn is_eip55_checksummed(body: &str) -> bool {
    use sha3::{Digest, Keccak256};

    let hash = Keccak256::digest(body.to_ascii_lowercase().as_bytes());
    body.chars().enumerate().all(|(i, c)| {
        if !c.is_ascii_alphabetic() {
            return true;
        }
        let nibble = if i % 2 == 0 {
            hash[i / 2] >> 4
        } else {
            hash[i / 2] & 0x0f
        };
        c.is_ascii_uppercase() == (nibble >= 8)
    })
}

const CASH_ADDR_PREFIX: &str = "bitcoincash";
const CASH_ADDR_GENERATORS: [u64; 5] = [
    0x98f2bc8e61,
    0x79b76d99e2,
    0xf33e5fb3c4,
    0xae2eabe2a8,
    0x1e4f43e470,
];

/// CashAddr (`bitcoincash:q...`), prefix optional, lowercase only
fn is_cash_address(address: &str) -> bool {
    let body = address
        .strip_prefix(CASH_ADDR_PREFIX)
        .and_then(|rest| rest.strip_prefix(':'))
        .unwrap_or(address);
    if body.len() != 42 || !(body.starts_with('q') || body.starts_with('p')) {
        return false;
    }
    let Some(values) = body
        .chars()
        .map(|c| BECH32_CHARSET.find(c).map(|v| v as u64))
        .collect::<Option<Vec<_>>>()
    else {
        return false;
    };
    let prefix = CASH_ADDR_PREFIX.bytes().map(|b| u64::from(b & 0x1f));
    cash_addr_polymod(prefix.chain([0]).chain(values)) == 0
}

fn cash_addr_polymod(values: impl Iterator<Item = u64>) -> u64 {
    let checksum = values.fold(1_u64, |c, value| {
        let top = c >> 35;
        let mut c = ((c & 0x07_ffff_ffff) << 5) ^ value;
        for (i, generator) in CASH_ADDR_GENERATORS.iter().enumerate() {
            if (top >> i) & 1 == 1 {
                c ^= generator;
            }
        }
        c
    });
    checksum ^ 1
}

impl fmt::Display for Blockchain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Blockchain {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let slug = s.to_lowercase();
        Blockchain::ALL
            .into_iter()
            .find(|b| b.as_str() == slug)
            .ok_or_else(|| format!("Unknown blockchain: {}", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blockchain_roundtrip_str() {
        for b in Blockchain::ALL {
            assert_eq!(b.as_str().parse::<Blockchain>().unwrap(), b);
        }
        assert_eq!("BSC".parse::<Blockchain>().unwrap(), Blockchain::BinanceSmartChain);
        assert!("solana".parse::<Blockchain>().is_err());
    }

    #[test]
    fn test_chain_families() {
        assert!(Blockchain::Polygon.is_evm());
        assert!(!Blockchain::Tron.is_evm());
        assert!(Blockchain::Dogecoin.is_utxo());
        assert!(Blockchain::Tron.requires_transfer_kind_hint());
        assert!(!Blockchain::Ethereum.requires_transfer_kind_hint());
        assert!(Blockchain::Litecoin.supports_address_type_hint());
        assert!(!Blockchain::Dogecoin.supports_address_type_hint());
    }

    #[test]
    fn test_address_validation() {
        assert!(Blockchain::Ethereum.is_valid_address("0x52908400098527886E0F7030069857D2E4169EE7"));
        assert!(Blockchain::Polygon.is_valid_address("0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed"));
        assert!(Blockchain::Ethereum.is_valid_address("0x5aaeb6053f3e94c9b9a09f33669435e7ef1beaed"));
        assert!(!Blockchain::Ethereum.is_valid_address("0x5290840009852788"));
        assert!(!Blockchain::Ethereum.is_valid_address("52908400098527886E0F7030069857D2E4169EE7"));

        assert!(Blockchain::Bitcoin.is_valid_address("bc1qar0srrr7xfkvy5l643lydnw9re59gtzzwf5mdq"));
        assert!(Blockchain::Bitcoin.is_valid_address("1BvBMSEYstWetqTFn5Au4m4GFg7xJaNVN2"));
        assert!(Blockchain::Bitcoin.is_valid_address("1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa"));
        assert!(!Blockchain::Bitcoin.is_valid_address("0x52908400098527886E0F7030069857D2E4169EE7"));

        assert!(Blockchain::Litecoin.is_valid_address("LTThKJwdvK458fWNBcLp7VMd78RGMPwmxR"));
        assert!(Blockchain::Litecoin.is_valid_address("ltc1qqypqxpq9qcrsszg2pvxq6rs0zqg3yyc5dyg36p"));
        assert!(Blockchain::Dogecoin.is_valid_address("DDNqbMaT94iJQrzok4M5PETTn3nHeqC4oJ"));
        assert!(Blockchain::BitcoinCash.is_valid_address(
            "bitcoincash:qpm2qsznhks23z7629mms6s4cwef74vcwvy22gdx6a"
        ));
        assert!(Blockchain::BitcoinCash.is_valid_address("qpm2qsznhks23z7629mms6s4cwef74vcwvy22gdx6a"));

        assert!(Blockchain::Tron.is_valid_address("TLa2f6VPqDgRE67v1736s7bJ8Ray5wYjU7"));
        assert!(!Blockchain::Tron.is_valid_address("TLa2f6VPqDgRE67v1736s7bJ8Ray5wYjU"));
        assert!(!Blockchain::Tron.is_valid_address(""));
    }

    #[test]
    fn test_mistyped_addresses_are_rejected() {
        // One character off from the valid addresses above
        assert!(!Blockchain::Tron.is_valid_address("TR7NHqjeKQxGTCi8q8ZY4pL8otSzgjLj6u"));
        assert!(!Blockchain::Bitcoin.is_valid_address("1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNb"));
        assert!(!Blockchain::Bitcoin.is_valid_address("bc1qar0srrr7xfkvy5l643lydnw9re59gtzzwf5mdr"));
        assert!(!Blockchain::BitcoinCash.is_valid_address(
            "bitcoincash:qpm2qsznhks23z7629mms6s4cwef74vcwvy22gdx6c"
        ));
        // Case of the last letter flipped
        assert!(!Blockchain::Ethereum.is_valid_address("0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAeD"));
    }

    #[test]
    fn test_addresses_are_bound_to_their_chain() {
        assert!(!Blockchain::Bitcoin.is_valid_address("TLa2f6VPqDgRE67v1736s7bJ8Ray5wYjU7"));
        assert!(!Blockchain::Tron.is_valid_address("1BvBMSEYstWetqTFn5Au4m4GFg7xJaNVN2"));
        assert!(!Blockchain::Dogecoin.is_valid_address("LTThKJwdvK458fWNBcLp7VMd78RGMPwmxR"));
        assert!(!Blockchain::Litecoin.is_valid_address("bc1qar0srrr7xfkvy5l643lydnw9re59gtzzwf5mdq"));
        assert!(!Blockchain::Bitcoin.is_valid_address("ltc1qqypqxpq9qcrsszg2pvxq6rs0zqg3yyc5dyg36p"));
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&Blockchain::BinanceSmartChain).unwrap();
        assert_eq!(json, "\"bsc\"");
        let b: Blockchain = serde_json::from_str("\"bitcoincash\"").unwrap();
        assert_eq!(b, Blockchain::BitcoinCash);
    }
}
