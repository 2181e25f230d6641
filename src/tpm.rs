// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Root-of-trust adapter.
//!
//! This wraps whatever device holds our PCRs and enforces the two rules the
//! rest of the sequencer relies on: the root of trust is set up exactly once
//! per cold boot, and nothing gets extended before that happens.

use log::{error, info};
use num_derive::FromPrimitive;
use thiserror::Error;

/// Largest digest we carry around (SHA-512).
pub const MAX_DIGEST_LEN: usize = 64;

/// Number of PCRs in a bank.
pub const PCR_COUNT: u8 = 24;

/// Digest algorithms, numbered by their TPM 2.0 algorithm IDs.
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(u16)]
pub enum HashAlg {
    Sha256 = 0x000b,
    Sha384 = 0x000c,
    Sha512 = 0x000d,
}

impl HashAlg {
    pub fn digest_len(self) -> usize {
        match self {
            HashAlg::Sha256 => 32,
            HashAlg::Sha384 => 48,
            HashAlg::Sha512 => 64,
        }
    }
}

/// A digest tagged with the algorithm that produced it.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Digest {
    alg: HashAlg,
    bytes: [u8; MAX_DIGEST_LEN],
}

impl Digest {
    /// Builds a digest from `bytes`, which must be exactly as long as `alg`
    /// says.
    pub fn new(alg: HashAlg, bytes: &[u8]) -> Option<Self> {
        if bytes.len() != alg.digest_len() {
            return None;
        }
        let mut d = Self {
            alg,
            bytes: [0; MAX_DIGEST_LEN],
        };
        d.bytes[..bytes.len()].copy_from_slice(bytes);
        Some(d)
    }

    pub fn sha256(bytes: [u8; 32]) -> Self {
        let mut d = Self {
            alg: HashAlg::Sha256,
            bytes: [0; MAX_DIGEST_LEN],
        };
        d.bytes[..32].copy_from_slice(&bytes);
        d
    }

    pub fn alg(&self) -> HashAlg {
        self.alg
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.alg.digest_len()]
    }
}

/// A PCR extension record.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Measurement {
    pub pcr: u8,
    pub digest: Digest,
}

/// How the TPM should be started.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StartupMode {
    /// Cold boot: reset PCRs and volatile state.
    Clear,
    /// S3 resume: restore saved state.
    Resume,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Error)]
pub enum TpmError {
    #[error("root of trust already set up this boot")]
    AlreadySetUp,
    #[error("root of trust not set up")]
    NotSetUp,
    #[error("TPM already initialised")]
    AlreadyStarted,
    #[error("no such PCR {0}")]
    BadPcr(u8),
    #[error("digest algorithm not supported")]
    UnsupportedAlg,
    #[error("transport failure")]
    Transport,
    #[error("TPM returned {0:#x}")]
    Response(u32),
    #[error("malformed TPM response")]
    Malformed,
}

/// Operations provided by a device that holds PCRs.
pub trait PcrBank {
    /// Starts the device. Returns `AlreadyStarted` if it had been started
    /// since its last reset.
    fn startup(&self, mode: StartupMode) -> Result<(), TpmError>;

    /// Extends `pcr` with `digest`.
    fn extend(&self, pcr: u8, digest: &Digest) -> Result<(), TpmError>;
}

/// The root of trust for one boot attempt.
pub struct RootOfTrust<'d> {
    bank: &'d dyn PcrBank,
    set_up: bool,
}

impl<'d> RootOfTrust<'d> {
    pub fn new(bank: &'d dyn PcrBank) -> Self {
        Self {
            bank,
            set_up: false,
        }
    }

    pub fn is_set_up(&self) -> bool {
        self.set_up
    }

    /// Starts the TPM and establishes the root of trust.
    ///
    /// Calling this twice in one boot is a bug in the caller and is reported
    /// as such rather than being passed to the device.
    pub fn setup(&mut self, mode: StartupMode) -> Result<(), TpmError> {
        if self.set_up {
            return Err(TpmError::AlreadySetUp);
        }
        match self.bank.startup(mode) {
            Ok(()) => {}
            // Whatever ran before us on the resume path may have done this
            // already.
            Err(TpmError::AlreadyStarted) if mode == StartupMode::Resume => {
                info!("TPM: already initialised");
            }
            Err(e) => {
                error!("TPM: setup failed: {}", e);
                return Err(e);
            }
        }
        info!("TPM: setup succeeded");
        self.set_up = true;
        Ok(())
    }

    /// Extends PCR `index` with `digest`.
    ///
    /// This changes the PCR value every time it's called, including for
    /// repeated digests; callers are responsible for not measuring anything
    /// twice.
    pub fn extend_pcr(&mut self, index: u8, digest: &Digest) -> Result<(), TpmError> {
        if !self.set_up {
            return Err(TpmError::NotSetUp);
        }
        if index >= PCR_COUNT {
            return Err(TpmError::BadPcr(index));
        }
        self.bank.extend(index, digest)
    }
}
