use anyhow::{Result, anyhow};

pub fn normalize_domain(input: &str) -> Result<String> {
    let trimmed = input.trim().trim_end_matches('.');
    if trimmed.is_empty() {
        return Err(anyhow!("domain name is required"));
    }
    let ascii = idna::domain_to_ascii(trimmed)
        .map_err(|err| anyhow!("invalid domain name {trimmed:?}: {err}"))?;
    Ok(ascii.to_lowercase())
}

/// Validates and normalizes a requested domain set for issuance.
/// Returns the sorted, deduplicated set or an error if nothing valid remains.
pub fn normalize_domain_set(domains: Vec<String>) -> Result<Vec<String>> {
    if domains.is_empty() {
        return Err(anyhow!("at least one domain is required"));
    }

    let mut normalized = Vec::with_capacity(domains.len());
    for domain in domains {
        if domain.trim().is_empty() {
            continue;
        }
        normalized.push(normalize_domain(&domain)?);
    }

    normalized.sort();
    normalized.dedup();

    if normalized.is_empty() {
        return Err(anyhow!("no valid domains provided"));
    }

    Ok(normalized)
}
