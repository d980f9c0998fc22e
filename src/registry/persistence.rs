//! Registry persistence as a human-readable `modules` file.
//!
//! Format: one line per module, pipe-separated
//! `address|type|version|status`. Loading re-populates every record in
//! `Offline` state — only a successful probe transitions a module back
//! to Online.

use std::io::{self, Write};

use crate::registry::{ModuleRegistry, ModuleStatus, ModuleType};

pub fn serialize(registry: &ModuleRegistry) -> String {
    let mut out = String::new();
    for record in registry.snapshot() {
        out.push_str(&format!(
            "{:02x}|{}|{}|{}\n",
            record.address,
            record.module_type.as_str(),
            record.version,
            record.status.as_str(),
        ));
    }
    out
}

pub fn save(registry: &ModuleRegistry, writer: &mut impl Write) -> io::Result<()> {
    writer.write_all(serialize(registry).as_bytes())
}

/// Parse a persisted blob and upsert every entry into `registry` in
/// `Offline` status, preserving the `{address, type, version}` triple —
/// `serialize` then `deserialize` yields an equivalent registry.
pub fn deserialize(text: &str, registry: &ModuleRegistry, now_ms: u64) {
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split('|').collect();
        if fields.len() != 4 {
            continue;
        }
        let Ok(address) = u8::from_str_radix(fields[0], 16) else {
            continue;
        };
        let module_type = ModuleType::from_str(fields[1]);
        let version = fields[2].to_string();
        registry.upsert_discovered(address, module_type, version, now_ms);
        registry.mark_offline(address);
        let _ = ModuleStatus::from_str(fields[3]);
    }
}

pub fn load(reader: impl io::Read, registry: &ModuleRegistry, now_ms: u64) -> io::Result<()> {
    let mut text = String::new();
    let mut reader = reader;
    reader.read_to_string(&mut text)?;
    deserialize(&text, registry, now_ms);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_identity_triple() {
        let registry = ModuleRegistry::new();
        registry.upsert_discovered(0x02, ModuleType::Power, "v2.1.0".into(), 0);
        registry.upsert_discovered(0x03, ModuleType::Safety, "v1.0.0".into(), 0);

        let text = serialize(&registry);

        let restored = ModuleRegistry::new();
        deserialize(&text, &restored, 1_000);

        let a = restored.get(0x02).unwrap();
        assert_eq!(a.module_type, ModuleType::Power);
        assert_eq!(a.version, "v2.1.0");
        assert_eq!(a.status, ModuleStatus::Offline);

        let b = restored.get(0x03).unwrap();
        assert_eq!(b.module_type, ModuleType::Safety);
        assert_eq!(b.version, "v1.0.0");
    }
}
