// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! TPM 2.0 backend.
//!
//! This speaks just enough of the TPM 2.0 command set to act as both a PCR
//! bank and an NV region store. Everything on the wire is big-endian; the
//! fixed-layout parts are described as `zerocopy` structs and the rest is
//! appended field by field.
//!
//! Authorised commands use a single empty password session, which is what
//! firmware running with platform hierarchy authorisation is expected to do.

use core::cell::{Cell, RefCell};

use heapless::Vec;
use log::{debug, error, warn};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use static_assertions::const_assert_eq;
use zerocopy::byteorder::{BigEndian, U16, U32};
use zerocopy::{AsBytes, FromBytes, LayoutVerified, Unaligned};

use crate::nvdata::{NvError, RegionKind, RegionStorage, SpaceSpec};
use crate::tpm::{Digest, HashAlg, PcrBank, StartupMode, TpmError};

/// Largest command or response we ever exchange.
pub const TPM_BUFFER_SIZE: usize = 256;

pub const TPM_ST_NO_SESSIONS: u16 = 0x8001;
pub const TPM_ST_SESSIONS: u16 = 0x8002;

pub const TPM_SU_CLEAR: u16 = 0x0000;
pub const TPM_SU_STATE: u16 = 0x0001;

pub const TPM_RH_PLATFORM: u32 = 0x4000_000c;
pub const TPM_RS_PW: u32 = 0x4000_0009;

/// Handle range for NV indices.
pub const TPM_HT_NV_INDEX: u32 = 0x0100_0000;

/// NV indices used for the secure regions. These are fixed by the layout of
/// provisioned parts.
pub const FIRMWARE_NV_INDEX: u32 = 0x1007;
pub const KERNEL_NV_INDEX: u32 = 0x1008;
pub const FWMP_NV_INDEX: u32 = 0x100a;
pub const REC_HASH_NV_INDEX: u32 = 0x100b;
pub const NORMAL_HASH_NV_INDEX: u32 = 0x100d;

#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(u32)]
pub enum CommandCode {
    NvDefineSpace = 0x12a,
    NvWrite = 0x137,
    NvWriteLock = 0x138,
    Startup = 0x144,
    NvRead = 0x14e,
    PcrExtend = 0x182,
}

/// Response codes we need to tell apart. Anything else is a fault.
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(u32)]
pub enum ResponseCode {
    Success = 0x000,
    Initialize = 0x100,
    NvLocked = 0x148,
    NvUninitialized = 0x14a,
    NvDefined = 0x14c,
    /// `TPM_RC_HANDLE` against the first handle: no such NV index.
    BadIndex = 0x18b,
}

/// Header shared by every command and response.
#[derive(Copy, Clone, Debug, AsBytes, FromBytes, Unaligned)]
#[repr(C)]
pub struct Header {
    pub tag: U16<BigEndian>,
    pub size: U32<BigEndian>,
    /// Command code for commands, response code for responses.
    pub code: U32<BigEndian>,
}

const_assert_eq!(core::mem::size_of::<Header>(), 10);

/// A password session with an empty password.
#[derive(Copy, Clone, Debug, AsBytes, FromBytes, Unaligned)]
#[repr(C)]
struct PasswordSession {
    handle: U32<BigEndian>,
    nonce_size: U16<BigEndian>,
    attributes: u8,
    hmac_size: U16<BigEndian>,
}

const_assert_eq!(core::mem::size_of::<PasswordSession>(), 9);

impl PasswordSession {
    fn empty() -> Self {
        Self {
            handle: U32::new(TPM_RS_PW),
            nonce_size: U16::new(0),
            attributes: 0,
            hmac_size: U16::new(0),
        }
    }
}

/// Returns the NV index that holds `kind`, if the TPM holds it at all.
pub fn nv_index(kind: RegionKind) -> Option<u32> {
    match kind {
        RegionKind::SecureFirmware => Some(FIRMWARE_NV_INDEX),
        RegionKind::SecureKernel => Some(KERNEL_NV_INDEX),
        RegionKind::FirmwareMgmtParams => Some(FWMP_NV_INDEX),
        RegionKind::RecoveryHash => Some(REC_HASH_NV_INDEX),
        RegionKind::NormalHash => Some(NORMAL_HASH_NV_INDEX),
        RegionKind::Standard | RegionKind::VerifiedStoreSlot => None,
    }
}

/// Errors from the link to the TPM.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TransportError {
    Timeout,
    Bus,
}

/// Moves command bytes to the TPM and response bytes back.
pub trait TpmTransport {
    /// Sends `command` and fills `response`, returning the number of response
    /// bytes received.
    fn transact(&mut self, command: &[u8], response: &mut [u8]) -> Result<usize, TransportError>;
}

/// Builds one command.
pub struct Command {
    buf: Vec<u8, TPM_BUFFER_SIZE>,
}

impl Command {
    pub fn new(tag: u16, code: CommandCode) -> Self {
        let header = Header {
            tag: U16::new(tag),
            // Patched in `finish`.
            size: U32::new(0),
            code: U32::new(code as u32),
        };
        let mut buf = Vec::new();
        // A fresh buffer always has room for a header.
        let _ = buf.extend_from_slice(header.as_bytes());
        Self { buf }
    }

    pub fn u8(&mut self, v: u8) -> Result<&mut Self, TpmError> {
        self.bytes(&[v])
    }

    pub fn u16(&mut self, v: u16) -> Result<&mut Self, TpmError> {
        self.bytes(&v.to_be_bytes())
    }

    pub fn u32(&mut self, v: u32) -> Result<&mut Self, TpmError> {
        self.bytes(&v.to_be_bytes())
    }

    pub fn bytes(&mut self, b: &[u8]) -> Result<&mut Self, TpmError> {
        self.buf.extend_from_slice(b).map_err(|_| TpmError::Malformed)?;
        Ok(self)
    }

    /// Appends a `TPM2B`: a 16-bit length followed by the bytes.
    pub fn sized(&mut self, b: &[u8]) -> Result<&mut Self, TpmError> {
        let len = u16::try_from(b.len()).map_err(|_| TpmError::Malformed)?;
        self.u16(len)?.bytes(b)
    }

    /// Appends an authorisation area holding one empty password session.
    pub fn password_auth(&mut self) -> Result<&mut Self, TpmError> {
        let session = PasswordSession::empty();
        let len = session.as_bytes().len() as u32;
        self.u32(len)?.bytes(session.as_bytes())
    }

    /// Fills in the size field and returns the encoded command.
    pub fn finish(&mut self) -> &[u8] {
        let len = self.buf.len() as u32;
        self.buf[2..6].copy_from_slice(&len.to_be_bytes());
        &self.buf
    }
}

/// Walks the parameter area of a response.
struct Reader<'a> {
    rest: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], TpmError> {
        if self.rest.len() < n {
            return Err(TpmError::Malformed);
        }
        let (head, tail) = self.rest.split_at(n);
        self.rest = tail;
        Ok(head)
    }

    fn u16(&mut self) -> Result<u16, TpmError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, TpmError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn sized(&mut self) -> Result<&'a [u8], TpmError> {
        let n = self.u16()?;
        self.take(usize::from(n))
    }
}

/// Splits a response into its response code and body (everything after the
/// header), checking that the advertised size matches what arrived.
pub fn parse_response(bytes: &[u8]) -> Result<(u32, &[u8]), TpmError> {
    let (header, body) = LayoutVerified::<_, Header>::new_unaligned_from_prefix(bytes)
        .ok_or(TpmError::Malformed)?;
    let header = header.into_ref();
    if header.size.get() as usize != bytes.len() {
        return Err(TpmError::Malformed);
    }
    Ok((header.code.get(), body))
}

/// A TPM 2.0 device on the other end of a transport.
pub struct Tpm2<T> {
    transport: RefCell<T>,
    started: Cell<bool>,
}

impl<T: TpmTransport> Tpm2<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport: RefCell::new(transport),
            started: Cell::new(false),
        }
    }

    /// Whether a `TPM2_Startup` has been accepted (or refused as redundant).
    pub fn is_started(&self) -> bool {
        self.started.get()
    }

    pub fn into_transport(self) -> T {
        self.transport.into_inner()
    }

    /// Sends `cmd` and returns the response code and response body.
    fn send<'r>(
        &self,
        cmd: &mut Command,
        response: &'r mut [u8; TPM_BUFFER_SIZE],
    ) -> Result<(u32, &'r [u8]), TpmError> {
        let bytes = cmd.finish();
        debug!("TPM: command {:02x?}", bytes);
        let n = self
            .transport
            .borrow_mut()
            .transact(bytes, &mut response[..])
            .map_err(|e| {
                error!("TPM: transport error {:?}", e);
                TpmError::Transport
            })?;
        let response = response.get(..n).ok_or(TpmError::Malformed)?;
        parse_response(response)
    }

    fn nv_handle(kind: RegionKind) -> Result<u32, NvError> {
        nv_index(kind)
            .map(|i| TPM_HT_NV_INDEX | i)
            .ok_or(NvError::Unsupported)
    }

    fn nv_command(
        &self,
        cmd: &mut Command,
        response: &mut [u8; TPM_BUFFER_SIZE],
    ) -> Result<(), NvError> {
        match self.send(cmd, response) {
            Ok((rc, _)) => nv_result(rc),
            Err(e) => {
                warn!("TPM: NV command failed: {}", e);
                Err(NvError::Fault)
            }
        }
    }
}

/// Maps a response code from an NV command.
fn nv_result(rc: u32) -> Result<(), NvError> {
    match ResponseCode::from_u32(rc) {
        Some(ResponseCode::Success) => Ok(()),
        Some(ResponseCode::NvLocked) => Err(NvError::Locked),
        Some(ResponseCode::NvUninitialized) | Some(ResponseCode::BadIndex) => {
            Err(NvError::NotFound)
        }
        _ => {
            warn!("TPM: NV command returned {:#x}", rc);
            Err(NvError::Fault)
        }
    }
}

fn encode_err(_: TpmError) -> NvError {
    NvError::BadSize
}

impl<T: TpmTransport> PcrBank for Tpm2<T> {
    fn startup(&self, mode: StartupMode) -> Result<(), TpmError> {
        let su = match mode {
            StartupMode::Clear => TPM_SU_CLEAR,
            StartupMode::Resume => TPM_SU_STATE,
        };
        let mut cmd = Command::new(TPM_ST_NO_SESSIONS, CommandCode::Startup);
        cmd.u16(su)?;
        let mut response = [0; TPM_BUFFER_SIZE];
        let (rc, _) = self.send(&mut cmd, &mut response)?;
        match ResponseCode::from_u32(rc) {
            Some(ResponseCode::Success) => {
                self.started.set(true);
                Ok(())
            }
            Some(ResponseCode::Initialize) => {
                self.started.set(true);
                Err(TpmError::AlreadyStarted)
            }
            _ => Err(TpmError::Response(rc)),
        }
    }

    fn extend(&self, pcr: u8, digest: &Digest) -> Result<(), TpmError> {
        let mut cmd = Command::new(TPM_ST_SESSIONS, CommandCode::PcrExtend);
        cmd.u32(u32::from(pcr))?
            .password_auth()?
            // TPML_DIGEST_VALUES with a single entry.
            .u32(1)?
            .u16(digest.alg() as u16)?
            .bytes(digest.as_bytes())?;
        let mut response = [0; TPM_BUFFER_SIZE];
        let (rc, _) = self.send(&mut cmd, &mut response)?;
        if rc != ResponseCode::Success as u32 {
            return Err(TpmError::Response(rc));
        }
        Ok(())
    }
}

impl<T: TpmTransport> RegionStorage for Tpm2<T> {
    fn supports(&self, kind: RegionKind) -> bool {
        nv_index(kind).is_some()
    }

    fn read(&self, kind: RegionKind, buf: &mut [u8]) -> Result<(), NvError> {
        let handle = Self::nv_handle(kind)?;
        let size = u16::try_from(buf.len()).map_err(|_| NvError::BadSize)?;
        let mut cmd = Command::new(TPM_ST_SESSIONS, CommandCode::NvRead);
        // The index authorises its own reads.
        cmd.u32(handle)
            .and_then(|c| c.u32(handle))
            .and_then(|c| c.password_auth())
            .and_then(|c| c.u16(size))
            .and_then(|c| c.u16(0))
            .map_err(encode_err)?;

        let mut response = [0; TPM_BUFFER_SIZE];
        let (rc, body) = self.send(&mut cmd, &mut response).map_err(|e| {
            warn!("TPM: NV read failed: {}", e);
            NvError::Fault
        })?;
        nv_result(rc)?;

        let mut r = Reader { rest: body };
        let data = r
            .u32()
            .and_then(|_param_size| r.sized())
            .map_err(|_| NvError::Fault)?;
        if data.len() != buf.len() {
            return Err(NvError::BadSize);
        }
        buf.copy_from_slice(data);
        Ok(())
    }

    fn write(&self, kind: RegionKind, data: &[u8]) -> Result<(), NvError> {
        let handle = Self::nv_handle(kind)?;
        let mut cmd = Command::new(TPM_ST_SESSIONS, CommandCode::NvWrite);
        cmd.u32(TPM_RH_PLATFORM)
            .and_then(|c| c.u32(handle))
            .and_then(|c| c.password_auth())
            .and_then(|c| c.sized(data))
            .and_then(|c| c.u16(0))
            .map_err(encode_err)?;
        let mut response = [0; TPM_BUFFER_SIZE];
        self.nv_command(&mut cmd, &mut response)
    }

    fn define(&self, kind: RegionKind, space: &SpaceSpec<'_>) -> Result<(), NvError> {
        let handle = Self::nv_handle(kind)?;
        let policy_len = u16::try_from(space.policy.len()).map_err(|_| NvError::BadSize)?;
        // TPMS_NV_PUBLIC: index, name alg, attributes, policy, data size.
        let public_len = 4 + 2 + 4 + 2 + policy_len + 2;
        let mut cmd = Command::new(TPM_ST_SESSIONS, CommandCode::NvDefineSpace);
        cmd.u32(TPM_RH_PLATFORM)
            .and_then(|c| c.password_auth())
            // Empty auth value for the new index.
            .and_then(|c| c.u16(0))
            .and_then(|c| c.u16(public_len))
            .and_then(|c| c.u32(handle))
            .and_then(|c| c.u16(HashAlg::Sha256 as u16))
            .and_then(|c| c.u32(space.attributes.bits()))
            .and_then(|c| c.sized(space.policy))
            .and_then(|c| c.u16(space.size))
            .map_err(encode_err)?;
        let mut response = [0; TPM_BUFFER_SIZE];
        match self.send(&mut cmd, &mut response) {
            Ok((rc, _)) if rc == ResponseCode::NvDefined as u32 => {
                debug!("TPM: index {:#x} already defined", handle);
                Ok(())
            }
            Ok((rc, _)) => nv_result(rc),
            Err(_) => Err(NvError::Fault),
        }
    }

    fn lock(&self, kind: RegionKind) -> Result<(), NvError> {
        let handle = Self::nv_handle(kind)?;
        let mut cmd = Command::new(TPM_ST_SESSIONS, CommandCode::NvWriteLock);
        cmd.u32(TPM_RH_PLATFORM)
            .and_then(|c| c.u32(handle))
            .and_then(|c| c.password_auth())
            .map_err(encode_err)?;
        let mut response = [0; TPM_BUFFER_SIZE];
        match self.nv_command(&mut cmd, &mut response) {
            // Write-locking an index that is already write-locked is what we
            // wanted anyway.
            Err(NvError::Locked) => Ok(()),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    /// Records commands and plays back canned responses.
    struct Scripted {
        sent: std::vec::Vec<std::vec::Vec<u8>>,
        replies: std::collections::VecDeque<std::vec::Vec<u8>>,
    }

    impl Scripted {
        fn new(replies: &[&[u8]]) -> Self {
            Self {
                sent: std::vec::Vec::new(),
                replies: replies.iter().map(|r| r.to_vec()).collect(),
            }
        }
    }

    impl TpmTransport for Scripted {
        fn transact(
            &mut self,
            command: &[u8],
            response: &mut [u8],
        ) -> Result<usize, TransportError> {
            self.sent.push(command.to_vec());
            let reply = self.replies.pop_front().ok_or(TransportError::Timeout)?;
            response[..reply.len()].copy_from_slice(&reply);
            Ok(reply.len())
        }
    }

    fn reply(tag: u16, rc: u32, body: &[u8]) -> std::vec::Vec<u8> {
        let mut v = std::vec::Vec::new();
        v.extend_from_slice(&tag.to_be_bytes());
        v.extend_from_slice(&((10 + body.len()) as u32).to_be_bytes());
        v.extend_from_slice(&rc.to_be_bytes());
        v.extend_from_slice(body);
        v
    }

    #[test]
    fn startup_clear_encoding() {
        let ok = reply(TPM_ST_NO_SESSIONS, 0, &[]);
        let tpm = Tpm2::new(Scripted::new(&[&ok]));
        tpm.startup(StartupMode::Clear).unwrap();
        let t = tpm.into_transport();
        assert_eq!(t.sent[0], hex!("8001 0000000c 00000144 0000"));
    }

    #[test]
    fn startup_already_initialised() {
        let rc = reply(TPM_ST_NO_SESSIONS, 0x100, &[]);
        let tpm = Tpm2::new(Scripted::new(&[&rc]));
        assert_eq!(tpm.startup(StartupMode::Resume), Err(TpmError::AlreadyStarted));
        assert!(tpm.is_started());
    }

    #[test]
    fn pcr_extend_encoding() {
        let ok = reply(TPM_ST_SESSIONS, 0, &[]);
        let tpm = Tpm2::new(Scripted::new(&[&ok]));
        tpm.extend(1, &Digest::sha256([0x11; 32])).unwrap();
        let t = tpm.into_transport();
        let sent = &t.sent[0];
        // header + handle + auth size + session + count + alg + digest
        assert_eq!(sent.len(), 10 + 4 + 4 + 9 + 4 + 2 + 32);
        assert_eq!(&sent[..10], &hex!("8002 00000041 00000182"));
        assert_eq!(&sent[10..14], &hex!("00000001"));
        assert_eq!(&sent[14..27], &hex!("00000009 40000009 0000 00 0000"));
        assert_eq!(&sent[27..33], &hex!("00000001 000b"));
        assert_eq!(&sent[33..], &[0x11; 32][..]);
    }

    #[test]
    fn nv_read_returns_data() {
        // param size, TPM2B with 4 bytes, then the (empty) auth response.
        let ok = reply(
            TPM_ST_SESSIONS,
            0,
            &hex!("00000006 0004 deadbeef 0000 01 0000"),
        );
        let tpm = Tpm2::new(Scripted::new(&[&ok]));
        let mut buf = [0; 4];
        tpm.read(RegionKind::SecureKernel, &mut buf).unwrap();
        assert_eq!(buf, hex!("deadbeef"));

        let t = tpm.into_transport();
        assert_eq!(&t.sent[0][10..18], &hex!("01001008 01001008"));
        assert_eq!(&t.sent[0][31..], &hex!("0004 0000"));
    }

    #[test]
    fn nv_response_codes() {
        let locked = reply(TPM_ST_SESSIONS, 0x148, &[]);
        let missing = reply(TPM_ST_SESSIONS, 0x18b, &[]);
        let odd = reply(TPM_ST_SESSIONS, 0x922, &[]);
        let tpm = Tpm2::new(Scripted::new(&[&locked, &missing, &odd]));

        assert_eq!(tpm.write(RegionKind::SecureFirmware, &[0; 10]), Err(NvError::Locked));
        let mut buf = [0; 10];
        assert_eq!(tpm.read(RegionKind::SecureFirmware, &mut buf), Err(NvError::NotFound));
        assert_eq!(tpm.write(RegionKind::SecureFirmware, &[0; 10]), Err(NvError::Fault));
    }

    #[test]
    fn relock_is_success() {
        let locked = reply(TPM_ST_SESSIONS, 0x148, &[]);
        let tpm = Tpm2::new(Scripted::new(&[&locked]));
        tpm.lock(RegionKind::SecureKernel).unwrap();
        let t = tpm.into_transport();
        assert_eq!(&t.sent[0][..18], &hex!("8002 0000001f 00000138 4000000c 01001008"));
    }

    #[test]
    fn regions_outside_tpm_are_unsupported() {
        let tpm = Tpm2::new(Scripted::new(&[]));
        assert!(!tpm.supports(RegionKind::Standard));
        assert!(!tpm.supports(RegionKind::VerifiedStoreSlot));
        assert_eq!(tpm.lock(RegionKind::Standard), Err(NvError::Unsupported));
        assert!(tpm.into_transport().sent.is_empty());
    }

    #[test]
    fn truncated_response_is_malformed() {
        assert_eq!(parse_response(&hex!("8001 0000")), Err(TpmError::Malformed));
        // Size field claims more than arrived.
        assert_eq!(
            parse_response(&hex!("8001 00000010 00000000")),
            Err(TpmError::Malformed)
        );
    }
}
