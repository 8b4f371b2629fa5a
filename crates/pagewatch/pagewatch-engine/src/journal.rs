//! Persisted change records.
//!
//! When event persistence is enabled, the worker writes one compact record
//! per published change into the value store under `evt/{seq}`, so a later
//! run (or another process opening the same store file) can read the change
//! history back. Records carry the previews and provenance of a change, not
//! its full payloads; payloads above the inline cap are already in the
//! store under their own `mem/...` keys and the record points at them.
//!
//! # Record layout (little-endian)
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ magic: u32 │ seq: u32 │ timestamp_ns: u64 │ adapter: u32     │
//! │ region: u32 │ epoch: u32 │ fault_ip: u64 │ line: u32        │
//! │ flags: u8 │ name_len: u8 │ file_len: u8 │ func_len: u8      │
//! │ key_old_len: u8 │ key_new_len: u8 │ old_len: u16            │
//! │ new_len: u16 │ user_data: u64                               │
//! ├──────────────────────────────────────────────────────────────┤
//! │ name │ file │ function │ key_old │ key_new │ old │ new      │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! `flags` bit 0/1: old/new payload unavailable; bit 2/3: old/new payload
//! spilled (its key follows in the variable section); bit 4: a source
//! location is present.

use pagewatch_core::{ChangeEvent, SourceLocation, ValuePayload, PREVIEW_MAX};

/// Identifies a journal record ("PWEV").
const EVENT_MAGIC: u32 = 0x5057_4556;

const FIXED_LEN: usize = 58;

const FLAG_OLD_UNAVAILABLE: u8 = 1 << 0;
const FLAG_NEW_UNAVAILABLE: u8 = 1 << 1;
const FLAG_OLD_SPILLED: u8 = 1 << 2;
const FLAG_NEW_SPILLED: u8 = 1 << 3;
const FLAG_HAS_LOCATION: u8 = 1 << 4;

/// Store key of the record for one sequence number.
pub fn key(seq: u32) -> String {
    format!("evt/{seq}")
}

fn truncated(s: &str, max: usize) -> &[u8] {
    // Byte-level cut; decode tolerates a lossy tail.
    &s.as_bytes()[..s.len().min(max)]
}

fn spilled_key(payload: &ValuePayload) -> &[u8] {
    match payload {
        ValuePayload::Spilled(key) => truncated(key, 255),
        _ => &[],
    }
}

pub fn encode(event: &ChangeEvent) -> Vec<u8> {
    let name = event.name.as_deref().map_or(&[][..], |s| truncated(s, 255));
    let (file, function, line) = match &event.location {
        Some(loc) => (
            truncated(&loc.file, 255),
            truncated(&loc.function, 255),
            loc.line,
        ),
        None => (&[][..], &[][..], 0),
    };
    let key_old = spilled_key(&event.old_value);
    let key_new = spilled_key(&event.new_value);

    let mut flags = 0u8;
    if event.old_value.is_unavailable() {
        flags |= FLAG_OLD_UNAVAILABLE;
    }
    if event.new_value.is_unavailable() {
        flags |= FLAG_NEW_UNAVAILABLE;
    }
    if !key_old.is_empty() {
        flags |= FLAG_OLD_SPILLED;
    }
    if !key_new.is_empty() {
        flags |= FLAG_NEW_SPILLED;
    }
    if event.location.is_some() {
        flags |= FLAG_HAS_LOCATION;
    }

    let old_preview = &event.old_preview[..event.old_preview.len().min(PREVIEW_MAX)];
    let new_preview = &event.new_preview[..event.new_preview.len().min(PREVIEW_MAX)];

    let mut out = Vec::with_capacity(
        FIXED_LEN
            + name.len()
            + file.len()
            + function.len()
            + key_old.len()
            + key_new.len()
            + old_preview.len()
            + new_preview.len(),
    );
    out.extend_from_slice(&EVENT_MAGIC.to_le_bytes());
    out.extend_from_slice(&event.seq.to_le_bytes());
    out.extend_from_slice(&event.timestamp_ns.to_le_bytes());
    out.extend_from_slice(&event.adapter_id.to_le_bytes());
    out.extend_from_slice(&event.region_id.to_le_bytes());
    out.extend_from_slice(&event.epoch.to_le_bytes());
    out.extend_from_slice(&event.fault_ip.to_le_bytes());
    out.extend_from_slice(&line.to_le_bytes());
    out.push(flags);
    out.push(name.len() as u8);
    out.push(file.len() as u8);
    out.push(function.len() as u8);
    out.push(key_old.len() as u8);
    out.push(key_new.len() as u8);
    out.extend_from_slice(&(old_preview.len() as u16).to_le_bytes());
    out.extend_from_slice(&(new_preview.len() as u16).to_le_bytes());
    out.extend_from_slice(&(event.user_data as u64).to_le_bytes());
    out.extend_from_slice(name);
    out.extend_from_slice(file);
    out.extend_from_slice(function);
    out.extend_from_slice(key_old);
    out.extend_from_slice(key_new);
    out.extend_from_slice(old_preview);
    out.extend_from_slice(new_preview);
    out
}

/// Decodes a journal record. Payload sides come back as `Spilled` when the
/// record carries a key and `Unavailable` otherwise; inline bytes are not
/// journaled.
pub fn decode(bytes: &[u8]) -> Option<ChangeEvent> {
    if bytes.len() < FIXED_LEN {
        return None;
    }
    let u32_at = |o: usize| u32::from_le_bytes(bytes[o..o + 4].try_into().unwrap());
    let u64_at = |o: usize| u64::from_le_bytes(bytes[o..o + 8].try_into().unwrap());
    let u16_at = |o: usize| u16::from_le_bytes(bytes[o..o + 2].try_into().unwrap());

    if u32_at(0) != EVENT_MAGIC {
        return None;
    }
    let seq = u32_at(4);
    let timestamp_ns = u64_at(8);
    let adapter_id = u32_at(16);
    let region_id = u32_at(20);
    let epoch = u32_at(24);
    let fault_ip = u64_at(28);
    let line = u32_at(36);
    let flags = bytes[40];
    let name_len = bytes[41] as usize;
    let file_len = bytes[42] as usize;
    let func_len = bytes[43] as usize;
    let key_old_len = bytes[44] as usize;
    let key_new_len = bytes[45] as usize;
    let old_len = u16_at(46) as usize;
    let new_len = u16_at(48) as usize;
    let user_data = u64_at(50);

    let total = FIXED_LEN
        + name_len
        + file_len
        + func_len
        + key_old_len
        + key_new_len
        + old_len
        + new_len;
    if bytes.len() < total {
        return None;
    }

    let mut cursor = FIXED_LEN;
    let name = &bytes[cursor..cursor + name_len];
    cursor += name_len;
    let file = &bytes[cursor..cursor + file_len];
    cursor += file_len;
    let function = &bytes[cursor..cursor + func_len];
    cursor += func_len;
    let key_old = &bytes[cursor..cursor + key_old_len];
    cursor += key_old_len;
    let key_new = &bytes[cursor..cursor + key_new_len];
    cursor += key_new_len;
    let old_preview = bytes[cursor..cursor + old_len].to_vec();
    cursor += old_len;
    let new_preview = bytes[cursor..cursor + new_len].to_vec();

    let payload = |spilled: bool, key: &[u8]| {
        if spilled {
            ValuePayload::Spilled(String::from_utf8_lossy(key).into_owned())
        } else {
            ValuePayload::Unavailable
        }
    };

    Some(ChangeEvent {
        seq,
        timestamp_ns,
        adapter_id,
        region_id,
        name: (name_len > 0).then(|| String::from_utf8_lossy(name).into_owned()),
        location: (flags & FLAG_HAS_LOCATION != 0).then(|| SourceLocation {
            file: String::from_utf8_lossy(file).into_owned(),
            function: String::from_utf8_lossy(function).into_owned(),
            line,
        }),
        fault_ip,
        epoch,
        old_preview,
        new_preview,
        old_value: payload(flags & FLAG_OLD_SPILLED != 0, key_old),
        new_value: payload(flags & FLAG_NEW_SPILLED != 0, key_new),
        user_data: user_data as usize,
    })
}
