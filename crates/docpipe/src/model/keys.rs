//! Object-key layout shared by admission and the stage processors.

/// Extensions accepted for source documents.
pub const ALLOWED_EXTENSIONS: &[&str] = &[
    "pdf", "txt", "md", "html", "json", "jsonl", "png", "jpg", "jpeg", "tiff",
];

/// Characters that are unsafe in object keys.
const RESERVED_CHARS: &[char] = &[
    '&', '$', '@', '=', ';', '/', ':', '+', ' ', ',', '?', '\\', '{', '}', '^', ']', '"', '>',
    '[', '~', '<', '#', '|', '%',
];

/// Key of an uploaded source document.
pub fn source_key(tenant_id: &str, job_id: &str, file_name: &str) -> String {
    format!("{}/{}/{}", tenant_id, job_id, file_name)
}

/// Key of the text extracted from one source document.
pub fn extraction_result_key(tenant_id: &str, extraction_job_id: &str, file_name: &str) -> String {
    format!(
        "{}/{}/{}/extracted_text.json",
        tenant_id, extraction_job_id, file_name
    )
}

/// Key of the chunk list produced for one document by one chunking job.
pub fn chunk_result_key(
    tenant_id: &str,
    extraction_job_id: &str,
    file_name: &str,
    chunking_job_id: &str,
) -> String {
    format!(
        "{}/{}/{}/chunk_{}.json",
        tenant_id, extraction_job_id, file_name, chunking_job_id
    )
}

/// Checks a client-supplied file name. Returns the rejection reason.
pub fn validate_file_name(file_name: &str) -> Result<(), String> {
    if file_name.trim().is_empty() {
        return Err("file name is empty".to_string());
    }

    if let Some(c) = file_name.chars().find(|c| RESERVED_CHARS.contains(c)) {
        return Err(format!("contains reserved character '{}'", c));
    }

    let extension = file_name
        .rsplit_once('.')
        .map(|(stem, ext)| (stem, ext.to_ascii_lowercase()))
        .filter(|(stem, _)| !stem.is_empty());

    match extension {
        Some((_, ext)) if ALLOWED_EXTENSIONS.contains(&ext.as_str()) => Ok(()),
        Some((_, ext)) => Err(format!("extension '.{}' is not supported", ext)),
        None => Err("missing file extension".to_string()),
    }
}
