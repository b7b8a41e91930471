//! PEM armouring and the PKCS#1 <-> PKCS#8 wrapping of RSA private keys.

use pem::{EncodeConfig, LineEnding, Pem};
use pkcs8::{
    der::{Decode, Encode},
    PrivateKeyInfo,
};

const ENCODE_CONFIG: EncodeConfig = EncodeConfig::new().set_line_ending(LineEnding::LF);

/// Encode `der` as a PEM block labelled `label`.
pub(crate) fn encode(label: &str, der: &[u8]) -> String {
    pem::encode_config(&Pem::new(label, der), ENCODE_CONFIG)
}

/// Extract the PKCS#1 `RSAPrivateKey` from an RSA PKCS#8 `PrivateKeyInfo`.
pub(crate) fn pkcs8_to_pkcs1(der: &[u8]) -> Option<&[u8]> {
    let info = PrivateKeyInfo::from_der(der).ok()?;
    (info.algorithm.oid == pkcs1::ALGORITHM_OID).then_some(info.private_key)
}

/// Wrap a PKCS#1 `RSAPrivateKey` into a PKCS#8 `PrivateKeyInfo`.
pub(crate) fn pkcs1_to_pkcs8(pkcs1: &[u8]) -> pkcs8::der::Result<Vec<u8>> {
    PrivateKeyInfo::new(pkcs1::ALGORITHM_ID, pkcs1).to_der()
}
