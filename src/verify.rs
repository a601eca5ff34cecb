// Copyright 2023 CoreOS, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Detached-signature verification of the manifest.
//!
//! When the agent is started with a public key, the bundle must carry the
//! manifest's detached signature as its second entry; the manifest is
//! verified before it is parsed.  Signatures are RSA PKCS#1 v1.5 over
//! SHA-256.

use anyhow::{anyhow, Context, Result};
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Public};
use openssl::sign::Verifier;
use std::path::Path;

use crate::errors::UpdateError;

pub struct SignatureVerifier {
    pubkey: PKey<Public>,
}

impl SignatureVerifier {
    pub fn from_pem_file(path: &Path) -> Result<Self> {
        let pem = std::fs::read(path)
            .with_context(|| format!("reading public key {}", path.display()))?;
        Self::from_pem(&pem)
    }

    pub fn from_pem(pem: &[u8]) -> Result<Self> {
        let pubkey = PKey::public_key_from_pem(pem).context("parsing public key")?;
        Ok(Self { pubkey })
    }

    /// Verify `signature` over `data`.
    pub fn verify(&self, data: &[u8], signature: &[u8]) -> Result<()> {
        let mut verifier = Verifier::new(MessageDigest::sha256(), &self.pubkey)
            .context("initializing signature verifier")?;
        verifier.update(data).context("hashing signed data")?;
        match verifier.verify(signature) {
            Ok(true) => {
                log::info!("manifest signature verified");
                Ok(())
            }
            Ok(false) => Err(anyhow!(UpdateError::Integrity(
                "manifest signature verification failed".into()
            ))),
            Err(e) => Err(anyhow!(UpdateError::Integrity(format!(
                "manifest signature is malformed: {e}"
            )))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use openssl::pkey::PKey;
    use openssl::rsa::Rsa;
    use openssl::sign::Signer;

    fn keypair() -> (PKey<openssl::pkey::Private>, SignatureVerifier) {
        let rsa = Rsa::generate(2048).unwrap();
        let private = PKey::from_rsa(rsa).unwrap();
        let public_pem = private.public_key_to_pem().unwrap();
        let verifier = SignatureVerifier::from_pem(&public_pem).unwrap();
        (private, verifier)
    }

    fn sign(key: &PKey<openssl::pkey::Private>, data: &[u8]) -> Vec<u8> {
        let mut signer = Signer::new(MessageDigest::sha256(), key).unwrap();
        signer.update(data).unwrap();
        signer.sign_to_vec().unwrap()
    }

    #[test]
    fn good_signature_accepted() {
        let (key, verifier) = keypair();
        let manifest = b"software = { version = \"1.0\"; };";
        let sig = sign(&key, manifest);
        verifier.verify(manifest, &sig).unwrap();
    }

    #[test]
    fn modified_data_rejected() {
        let (key, verifier) = keypair();
        let manifest = b"software = { version = \"1.0\"; };".to_vec();
        let sig = sign(&key, &manifest);
        let mut tampered = manifest;
        tampered[0] ^= 1;
        let err = verifier.verify(&tampered, &sig).unwrap_err();
        assert!(UpdateError::is_kind(&err, |e| {
            matches!(e, UpdateError::Integrity(_))
        }));
    }

    #[test]
    fn garbage_signature_rejected() {
        let (_, verifier) = keypair();
        let err = verifier.verify(b"data", b"not a signature").unwrap_err();
        assert!(UpdateError::is_kind(&err, |e| {
            matches!(e, UpdateError::Integrity(_))
        }));
    }

    #[test]
    fn wrong_key_rejected() {
        let (key, _) = keypair();
        let (_, other_verifier) = keypair();
        let data = b"payload";
        let sig = sign(&key, data);
        other_verifier.verify(data, &sig).unwrap_err();
    }
}
