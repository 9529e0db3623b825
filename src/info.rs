//! Builds the static, read-only `/<name>.info` text file.

use std::collections::HashMap;

const PRELUDE: &str = "The following values have been extracted from the mounted image file:\n\n";

/// Labels in the exact display order mandated for the info file, paired with
/// the EWF header-value identifiers (in preference order) that populate
/// them. Labels match `IMAGE_INFO_HEADER`'s `M_SAVE_VALUE` call sites
/// verbatim, trailing colon-space included. A label is skipped entirely when
/// none of its keys are present — this reader never populates an MD5/SHA1
/// hash section, so those two lines are simply never emitted, mirroring the
/// reference's conditional save.
const FIELDS: &[(&str, &[&str])] = &[
    ("Case number: ", &["c", "cn"]),
    ("Description: ", &["a"]),
    ("Examiner: ", &["e", "ex"]),
    ("Evidence number: ", &["n", "en"]),
    ("Notes: ", &["t", "nt"]),
    ("Acquiry date: ", &["m"]),
    ("System date: ", &["u"]),
    ("Acquiry os: ", &["ov"]),
    ("Acquiry sw version: ", &["av"]),
    ("MD5 hash: ", &["md5", "hash_md5"]),
    ("SHA1 hash: ", &["sha1", "hash_sha1"]),
];

/// Builds the info file contents. `ewf_metadata` is `Some` only when the
/// input image is an EWF container; any other input variant yields just the
/// prelude.
pub fn build_info_file(ewf_metadata: Option<&HashMap<String, String>>) -> String {
    let mut text = String::from(PRELUDE);

    let Some(metadata) = ewf_metadata else {
        return text;
    };

    for (label, keys) in FIELDS {
        if let Some(value) = keys.iter().find_map(|k| metadata.get(*k)) {
            text.push_str(label);
            text.push_str(value);
            text.push('\n');
        }
    }

    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_ewf_input_yields_just_the_prelude() {
        assert_eq!(build_info_file(None), PRELUDE);
    }

    #[test]
    fn populated_fields_render_in_the_mandated_order() {
        let mut metadata = HashMap::new();
        metadata.insert("cn".to_string(), "CASE-42".to_string());
        metadata.insert("e".to_string(), "J. Doe".to_string());

        let info = build_info_file(Some(&metadata));
        let case_pos = info.find("Case number: CASE-42").unwrap();
        let examiner_pos = info.find("Examiner: J. Doe").unwrap();
        assert!(case_pos < examiner_pos);
    }

    #[test]
    fn absent_hash_fields_are_omitted() {
        let mut metadata = HashMap::new();
        metadata.insert("a".to_string(), "a test image".to_string());
        let info = build_info_file(Some(&metadata));
        assert!(!info.contains("MD5 hash"));
        assert!(!info.contains("SHA1 hash"));
    }
}
