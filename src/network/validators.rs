use anyhow::{anyhow, Result};

const MAX_NAME_LEN: usize = 128;

pub fn validate_filename(filename: &str) -> Result<()> {
    if filename.is_empty() {
        return Err(anyhow!("Filename cannot be empty"));
    }
    if filename.contains("..") {
        return Err(anyhow!("Filename cannot contain '..'"));
    }
    if filename.chars().any(|c| matches!(c, '/' | '\\' | '\0')) {
        return Err(anyhow!("Filename contains invalid characters"));
    }
    if filename.len() > MAX_NAME_LEN {
        return Err(anyhow!("Filename must be {} characters or less", MAX_NAME_LEN));
    }
    Ok(())
}

/// Model names become file names in the config directory.
pub fn validate_model_name(name: &str) -> Result<()> {
    validate_filename(name).map_err(|e| anyhow!("Invalid model name: {}", e))?;
    if name.chars().any(|c| c.is_control()) {
        return Err(anyhow!("Invalid model name: control characters"));
    }
    Ok(())
}

pub fn validate_url(url: &str) -> Result<()> {
    if url.is_empty() {
        return Err(anyhow!("URL cannot be empty"));
    }
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(anyhow!("URL must start with http:// or https://"));
    }
    if url.chars().any(|c| c.is_control() || c == ' ') {
        return Err(anyhow!("URL contains invalid characters"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_filename() {
        assert!(validate_filename("update.zip").is_ok());
        assert!(validate_filename("../etc/passwd").is_err());
        assert!(validate_filename("file/name").is_err());
        assert!(validate_filename("").is_err());
        assert!(validate_filename(&"a".repeat(129)).is_err());
    }

    #[test]
    fn test_validate_model_name() {
        assert!(validate_model_name("dig-cont_0620_s3.tflite").is_ok());
        assert!(validate_model_name("sub/dig.tflite").is_err());
        assert!(validate_model_name("sub\\dig.tflite").is_err());
        assert!(validate_model_name("..").is_err());
        assert!(validate_model_name("dig\0.tfl").is_err());
        assert!(validate_model_name("dig\n.tfl").is_err());
    }

    #[test]
    fn test_validate_url() {
        assert!(validate_url("https://example.com/manifest.json").is_ok());
        assert!(validate_url("ftp://example.com").is_err());
        assert!(validate_url("https://exa mple.com").is_err());
    }
}
