//! SPIR-V validation helpers
//!
//! Catches malformed operator shaders before they reach the driver, with
//! clearer messages than the driver's generic failures.

/// SPIR-V magic number (first word, little-endian).
pub const SPIRV_MAGIC: u32 = 0x0723_0203;

const HEADER_WORDS: usize = 5;
const OP_ENTRY_POINT: u32 = 15;
const EXECUTION_MODEL_GL_COMPUTE: u32 = 5;

/// Validate the SPIR-V header.
///
/// Checks size, 4-byte alignment, magic number, version (1.0 - 1.6) and a
/// non-zero id bound. This is NOT a full validator; run spirv-val for that.
pub fn validate_spirv(bytes: &[u8]) -> Result<(), String> {
    if bytes.len() < HEADER_WORDS * 4 {
        return Err(format!(
            "SPIR-V too small: {} bytes (minimum {})",
            bytes.len(),
            HEADER_WORDS * 4
        ));
    }

    if bytes.len() % 4 != 0 {
        return Err(format!("SPIR-V size ({}) not 4-byte aligned", bytes.len()));
    }

    let words = to_words(bytes);

    if words[0] != SPIRV_MAGIC {
        return Err(format!(
            "Invalid SPIR-V magic: 0x{:08x} (expected 0x{:08x})",
            words[0], SPIRV_MAGIC
        ));
    }

    let major = (words[1] >> 16) & 0xFF;
    let minor = (words[1] >> 8) & 0xFF;
    if major != 1 || minor > 6 {
        return Err(format!(
            "Unsupported SPIR-V version: {}.{} (supported: 1.0-1.6)",
            major, minor
        ));
    }

    if words[3] == 0 {
        return Err("SPIR-V bound is 0 (invalid)".to_string());
    }

    log::trace!(
        "SPIR-V header ok: version {}.{}, bound {}, size {}",
        major,
        minor,
        words[3],
        bytes.len()
    );

    Ok(())
}

/// Validate the header and require a `GLCompute` entry point named `entry_point`.
pub fn validate_compute_spirv(bytes: &[u8], entry_point: &str) -> Result<(), String> {
    validate_spirv(bytes)?;

    let words = to_words(bytes);
    let entry_points = compute_entry_points(&words)?;
    if !entry_points.iter().any(|name| name == entry_point) {
        return Err(format!(
            "no GLCompute entry point named '{}' (found: {:?})",
            entry_point, entry_points
        ));
    }
    Ok(())
}

/// Names of all `OpEntryPoint GLCompute` instructions in the module.
pub fn compute_entry_points(words: &[u32]) -> Result<Vec<String>, String> {
    let mut names = Vec::new();
    let mut offset = HEADER_WORDS;

    while offset < words.len() {
        let word_count = (words[offset] >> 16) as usize;
        let opcode = words[offset] & 0xFFFF;
        if word_count == 0 || offset + word_count > words.len() {
            return Err(format!(
                "truncated instruction at word {} (count {})",
                offset, word_count
            ));
        }

        if opcode == OP_ENTRY_POINT && word_count >= 4 {
            let model = words[offset + 1];
            if model == EXECUTION_MODEL_GL_COMPUTE {
                names.push(decode_literal_string(&words[offset + 3..offset + word_count]));
            }
        }

        offset += word_count;
    }

    Ok(names)
}

/// Check if bytes look like SPIR-V (quick magic check).
#[inline]
pub fn is_spirv(bytes: &[u8]) -> bool {
    bytes.len() >= 4 && bytes[0..4] == SPIRV_MAGIC.to_le_bytes()
}

/// Convert little-endian bytes to SPIR-V words (trailing partial word dropped).
pub fn to_words(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

fn decode_literal_string(words: &[u32]) -> String {
    let mut bytes = Vec::new();
    'outer: for word in words {
        for byte in word.to_le_bytes() {
            if byte == 0 {
                break 'outer;
            }
            bytes.push(byte);
        }
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    fn encode_literal(name: &str) -> Vec<u32> {
        let mut bytes = name.as_bytes().to_vec();
        bytes.push(0);
        while bytes.len() % 4 != 0 {
            bytes.push(0);
        }
        to_words(&bytes)
    }

    /// Header plus one `OpEntryPoint <model> %1 "<name>"`.
    pub(crate) fn module_with_entry_point(model: u32, name: &str) -> Vec<u8> {
        let mut words = vec![SPIRV_MAGIC, 0x0001_0300, 0, 8, 0];
        let literal = encode_literal(name);
        let count = 3 + literal.len() as u32;
        words.push((count << 16) | OP_ENTRY_POINT);
        words.push(model);
        words.push(1);
        words.extend(literal);
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    #[test]
    fn test_header_only_module_is_valid() {
        let bytes = module_with_entry_point(EXECUTION_MODEL_GL_COMPUTE, "main");
        assert!(validate_spirv(&bytes[..20]).is_ok());
    }

    #[test]
    fn test_invalid_magic_and_size() {
        let mut bytes = module_with_entry_point(EXECUTION_MODEL_GL_COMPUTE, "main");
        bytes[0] = 0;
        assert!(validate_spirv(&bytes).unwrap_err().contains("magic"));

        assert!(validate_spirv(&[0x03, 0x02, 0x23, 0x07])
            .unwrap_err()
            .contains("too small"));

        let mut unaligned = module_with_entry_point(EXECUTION_MODEL_GL_COMPUTE, "main");
        unaligned.push(0);
        assert!(validate_spirv(&unaligned).unwrap_err().contains("aligned"));
    }

    #[test]
    fn test_version_and_bound() {
        let mut bytes = module_with_entry_point(EXECUTION_MODEL_GL_COMPUTE, "main");
        bytes[5] = 0x07;
        assert!(validate_spirv(&bytes).unwrap_err().contains("version"));

        let mut bytes = module_with_entry_point(EXECUTION_MODEL_GL_COMPUTE, "main");
        bytes[12..16].copy_from_slice(&[0, 0, 0, 0]);
        assert!(validate_spirv(&bytes).unwrap_err().contains("bound"));
    }

    #[test]
    fn test_compute_entry_point_found() {
        let bytes = module_with_entry_point(EXECUTION_MODEL_GL_COMPUTE, "main");
        assert!(validate_compute_spirv(&bytes, "main").is_ok());
        assert_eq!(compute_entry_points(&to_words(&bytes)).unwrap(), vec!["main"]);
    }

    #[test]
    fn test_wrong_entry_point_or_model_rejected() {
        let bytes = module_with_entry_point(EXECUTION_MODEL_GL_COMPUTE, "main");
        assert!(validate_compute_spirv(&bytes, "conv").is_err());

        // Vertex shader (model 0) is not a compute entry point.
        let vertex = module_with_entry_point(0, "main");
        assert!(validate_compute_spirv(&vertex, "main").is_err());
    }

    #[test]
    fn test_truncated_instruction() {
        let mut words = to_words(&module_with_entry_point(EXECUTION_MODEL_GL_COMPUTE, "main"));
        words[5] = (40 << 16) | OP_ENTRY_POINT;
        assert!(compute_entry_points(&words).unwrap_err().contains("truncated"));
    }

    #[test]
    fn test_is_spirv_quick_check() {
        assert!(is_spirv(&[0x03, 0x02, 0x23, 0x07]));
        assert!(!is_spirv(&[0x00, 0x00, 0x00, 0x00]));
        assert!(!is_spirv(&[0x03, 0x02, 0x23]));
    }
}
