//! Spell encoding: vault actions embedded in a transaction's `OP_RETURN`.
//!
//! # Layout
//!
//! ```text
//! framed = push_prefix || body
//! body   = "SPVT" || version:u8 || action:u8 || fields...
//! ```
//!
//! Fields use Bitcoin consensus encoding: strings and lists carry a
//! compact-size length, integers are little-endian. The push prefix mirrors
//! script data pushes:
//!
//! | body length | prefix                     |
//! |-------------|----------------------------|
//! | 1–75        | `len`                      |
//! | 76–255      | `0x4c len`                 |
//! | 256–65535   | `0x4d len_lo len_hi`       |
//!
//! Encoding is canonical: the decoder rejects non-minimal prefixes, so every
//! accepted byte string has exactly one payload.

use bitcoin::consensus::encode::{self, Decodable, Encodable, VarInt};
use bitcoin::opcodes::all::{OP_PUSHDATA1, OP_PUSHDATA2, OP_RETURN};
use bitcoin::script::{Script, ScriptBuf};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{ActionKind, Beneficiary, VaultId, VaultStatus};

/// Protocol tag opening every spell body.
pub const PROTOCOL_TAG: [u8; 4] = *b"SPVT";

/// Current spell version.
pub const SPELL_VERSION: u8 = 1;

/// Default ceiling on the body length.
pub const DEFAULT_MAX_SPELL_LEN: usize = 1_024;

/// Largest body the two-byte prefix can describe.
pub const MAX_FRAMED_SPELL_LEN: usize = u16::MAX as usize;

/// Largest body that uses a direct length byte.
const MAX_DIRECT_PUSH: usize = 75;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SpellError {
    #[error("Spell body is {len} bytes, ceiling is {max} bytes")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("Unknown protocol tag")]
    UnknownProtocol,

    #[error("Unsupported spell version {0}")]
    UnsupportedVersion(u8),

    #[error("Unknown spell action code {0}")]
    UnknownAction(u8),

    #[error("Malformed spell: {0}")]
    Malformed(String),
}

/// Opens a vault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateVaultSpell {
    pub vault_id: VaultId,
    pub owner_address: String,
    pub beneficiaries: Vec<Beneficiary>,
    pub inactivity_period_secs: u64,
    pub amount_sats: u64,
    pub created_at: i64,
    pub last_check_in: i64,
    pub status: VaultStatus,
}

/// Resets the inactivity clock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckInSpell {
    pub vault_id: VaultId,
    pub checked_in_at: i64,
}

/// One beneficiary's claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimSpell {
    pub vault_id: VaultId,
    pub beneficiary_address: String,
    pub claimed_sats: u64,
    pub claimed_at: i64,
}

/// Returns the vault to its owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelSpell {
    pub vault_id: VaultId,
    pub cancelled_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpellAction {
    CreateVault(CreateVaultSpell),
    CheckIn(CheckInSpell),
    Claim(ClaimSpell),
    Cancel(CancelSpell),
}

impl SpellAction {
    pub fn kind(&self) -> ActionKind {
        match self {
            SpellAction::CreateVault(_) => ActionKind::CreateVault,
            SpellAction::CheckIn(_) => ActionKind::CheckIn,
            SpellAction::Claim(_) => ActionKind::Claim,
            SpellAction::Cancel(_) => ActionKind::Cancel,
        }
    }

    pub fn vault_id(&self) -> &VaultId {
        match self {
            SpellAction::CreateVault(s) => &s.vault_id,
            SpellAction::CheckIn(s) => &s.vault_id,
            SpellAction::Claim(s) => &s.vault_id,
            SpellAction::Cancel(s) => &s.vault_id,
        }
    }
}

/// A versioned spell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpellPayload {
    pub version: u8,
    pub action: SpellAction,
}

impl SpellPayload {
    /// A payload at the current version.
    pub fn new(action: SpellAction) -> Self {
        Self {
            version: SPELL_VERSION,
            action,
        }
    }

    pub fn kind(&self) -> ActionKind {
        self.action.kind()
    }
}

/// Spell encoder/decoder with a configurable body ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpellCodec {
    max_len: usize,
}

impl Default for SpellCodec {
    fn default() -> Self {
        Self {
            max_len: DEFAULT_MAX_SPELL_LEN,
        }
    }
}

impl SpellCodec {
    /// A codec with a custom ceiling, capped at [`MAX_FRAMED_SPELL_LEN`].
    pub fn with_max_len(max_len: usize) -> Self {
        Self {
            max_len: max_len.min(MAX_FRAMED_SPELL_LEN),
        }
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    /// Encode and frame a payload.
    pub fn encode(&self, payload: &SpellPayload) -> Result<Vec<u8>, SpellError> {
        let body = encode_body(payload)?;
        if body.len() > self.max_len {
            return Err(SpellError::PayloadTooLarge {
                len: body.len(),
                max: self.max_len,
            });
        }
        Ok(frame(&body))
    }

    /// Decode a framed payload. Accepts any canonically framed body up to the
    /// framing limit, regardless of this codec's encode ceiling.
    pub fn decode(&self, framed: &[u8]) -> Result<SpellPayload, SpellError> {
        decode_body(unframe(framed)?)
    }
}

/// Encode with the default ceiling.
pub fn encode_spell(payload: &SpellPayload) -> Result<Vec<u8>, SpellError> {
    SpellCodec::default().encode(payload)
}

/// Decode a framed spell.
pub fn decode_spell(framed: &[u8]) -> Result<SpellPayload, SpellError> {
    SpellCodec::default().decode(framed)
}

/// Wrap a framed spell in an `OP_RETURN` output script.
pub fn spell_script(framed: &[u8]) -> ScriptBuf {
    let mut bytes = Vec::with_capacity(framed.len() + 1);
    bytes.push(OP_RETURN.to_u8());
    bytes.extend_from_slice(framed);
    ScriptBuf::from_bytes(bytes)
}

/// Decode the spell carried by an output script, if it is an `OP_RETURN`.
pub fn extract_spell(script: &Script) -> Option<Result<SpellPayload, SpellError>> {
    if !script.is_op_return() {
        return None;
    }
    Some(decode_spell(&script.as_bytes()[1..]))
}

fn frame(body: &[u8]) -> Vec<u8> {
    let len = body.len();
    let mut out = Vec::with_capacity(len + 3);
    if len <= MAX_DIRECT_PUSH {
        out.push(len as u8);
    } else if len <= u8::MAX as usize {
        out.push(OP_PUSHDATA1.to_u8());
        out.push(len as u8);
    } else {
        out.push(OP_PUSHDATA2.to_u8());
        out.extend_from_slice(&(len as u16).to_le_bytes());
    }
    out.extend_from_slice(body);
    out
}

fn unframe(framed: &[u8]) -> Result<&[u8], SpellError> {
    let (&first, rest) = framed
        .split_first()
        .ok_or_else(|| SpellError::Malformed("empty spell".into()))?;

    let (len, body) = if first as usize <= MAX_DIRECT_PUSH {
        (first as usize, rest)
    } else if first == OP_PUSHDATA1.to_u8() {
        let (&len, body) = rest
            .split_first()
            .ok_or_else(|| SpellError::Malformed("truncated length".into()))?;
        if (len as usize) <= MAX_DIRECT_PUSH {
            return Err(SpellError::Malformed("non-minimal length prefix".into()));
        }
        (len as usize, body)
    } else if first == OP_PUSHDATA2.to_u8() {
        if rest.len() < 2 {
            return Err(SpellError::Malformed("truncated length".into()));
        }
        let len = u16::from_le_bytes([rest[0], rest[1]]) as usize;
        if len <= u8::MAX as usize {
            return Err(SpellError::Malformed("non-minimal length prefix".into()));
        }
        (len, &rest[2..])
    } else {
        return Err(SpellError::Malformed(format!(
            "unknown length prefix 0x{:02x}",
            first
        )));
    };

    if body.len() != len {
        return Err(SpellError::Malformed(format!(
            "length prefix says {} bytes, found {}",
            len,
            body.len()
        )));
    }
    Ok(body)
}

fn put<T: Encodable + ?Sized>(buf: &mut Vec<u8>, value: &T) {
    buf.extend_from_slice(&encode::serialize(value));
}

fn put_str(buf: &mut Vec<u8>, s: &str) {
    put(buf, &s.to_owned());
}

fn encode_body(payload: &SpellPayload) -> Result<Vec<u8>, SpellError> {
    if payload.version != SPELL_VERSION {
        return Err(SpellError::UnsupportedVersion(payload.version));
    }

    let mut buf = Vec::with_capacity(64);
    buf.extend_from_slice(&PROTOCOL_TAG);
    buf.push(payload.version);
    buf.push(payload.kind().code());

    match &payload.action {
        SpellAction::CreateVault(s) => {
            put_str(&mut buf, s.vault_id.as_str());
            put_str(&mut buf, &s.owner_address);
            put(&mut buf, &VarInt(s.beneficiaries.len() as u64));
            for b in &s.beneficiaries {
                put_str(&mut buf, &b.id);
                put_str(&mut buf, &b.name);
                put_str(&mut buf, &b.address);
                put(&mut buf, &b.percentage_share);
            }
            put(&mut buf, &s.inactivity_period_secs);
            put(&mut buf, &s.amount_sats);
            put(&mut buf, &s.created_at);
            put(&mut buf, &s.last_check_in);
            put(&mut buf, &s.status.code());
        }
        SpellAction::CheckIn(s) => {
            put_str(&mut buf, s.vault_id.as_str());
            put(&mut buf, &s.checked_in_at);
        }
        SpellAction::Claim(s) => {
            put_str(&mut buf, s.vault_id.as_str());
            put_str(&mut buf, &s.beneficiary_address);
            put(&mut buf, &s.claimed_sats);
            put(&mut buf, &s.claimed_at);
        }
        SpellAction::Cancel(s) => {
            put_str(&mut buf, s.vault_id.as_str());
            put(&mut buf, &s.cancelled_at);
        }
    }
    Ok(buf)
}

/// Cursor over a spell body.
struct Reader<'a> {
    bytes: &'a [u8],
}

impl<'a> Reader<'a> {
    fn read<T: Decodable>(&mut self) -> Result<T, SpellError> {
        let (value, consumed) = encode::deserialize_partial::<T>(self.bytes)
            .map_err(|e| SpellError::Malformed(e.to_string()))?;
        self.bytes = &self.bytes[consumed..];
        Ok(value)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], SpellError> {
        if self.bytes.len() < n {
            return Err(SpellError::Malformed("truncated body".into()));
        }
        let (head, tail) = self.bytes.split_at(n);
        self.bytes = tail;
        Ok(head)
    }

    fn byte(&mut self) -> Result<u8, SpellError> {
        Ok(self.take(1)?[0])
    }

    fn vault_id(&mut self) -> Result<VaultId, SpellError> {
        Ok(VaultId::new(self.read::<String>()?))
    }

    fn finish(self) -> Result<(), SpellError> {
        if self.bytes.is_empty() {
            Ok(())
        } else {
            Err(SpellError::Malformed(format!(
                "{} trailing bytes",
                self.bytes.len()
            )))
        }
    }
}

fn decode_body(body: &[u8]) -> Result<SpellPayload, SpellError> {
    let mut r = Reader { bytes: body };

    if r.take(PROTOCOL_TAG.len()).map_err(|_| SpellError::UnknownProtocol)? != PROTOCOL_TAG {
        return Err(SpellError::UnknownProtocol);
    }

    let version = r.byte()?;
    if version == 0 || version > SPELL_VERSION {
        return Err(SpellError::UnsupportedVersion(version));
    }

    let code = r.byte()?;
    let kind = ActionKind::from_code(code).ok_or(SpellError::UnknownAction(code))?;

    let action = match kind {
        ActionKind::CreateVault => {
            let vault_id = r.vault_id()?;
            let owner_address = r.read::<String>()?;
            let count = r.read::<VarInt>()?.0;
            // Each entry needs at least four bytes; reject absurd counts before allocating
            if count > (r.bytes.len() / 4) as u64 {
                return Err(SpellError::Malformed(format!(
                    "beneficiary count {} exceeds body",
                    count
                )));
            }
            let mut beneficiaries = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let id = r.read::<String>()?;
                let name = r.read::<String>()?;
                let address = r.read::<String>()?;
                let percentage_share = r.byte()?;
                beneficiaries.push(Beneficiary {
                    id,
                    name,
                    address,
                    percentage_share,
                });
            }
            let inactivity_period_secs = r.read::<u64>()?;
            let amount_sats = r.read::<u64>()?;
            let created_at = r.read::<i64>()?;
            let last_check_in = r.read::<i64>()?;
            let status_code = r.byte()?;
            let status = VaultStatus::from_code(status_code).ok_or_else(|| {
                SpellError::Malformed(format!("unknown status code {}", status_code))
            })?;
            SpellAction::CreateVault(CreateVaultSpell {
                vault_id,
                owner_address,
                beneficiaries,
                inactivity_period_secs,
                amount_sats,
                created_at,
                last_check_in,
                status,
            })
        }
        ActionKind::CheckIn => SpellAction::CheckIn(CheckInSpell {
            vault_id: r.vault_id()?,
            checked_in_at: r.read::<i64>()?,
        }),
        ActionKind::Claim => SpellAction::Claim(ClaimSpell {
            vault_id: r.vault_id()?,
            beneficiary_address: r.read::<String>()?,
            claimed_sats: r.read::<u64>()?,
            claimed_at: r.read::<i64>()?,
        }),
        ActionKind::Cancel => SpellAction::Cancel(CancelSpell {
            vault_id: r.vault_id()?,
            cancelled_at: r.read::<i64>()?,
        }),
    };

    r.finish()?;
    Ok(SpellPayload { version, action })
}
