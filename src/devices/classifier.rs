use crate::devices::llm::OpenAiCompatibleClassifier;
use crate::devices::signatures::{DeviceClassification, SignatureDb};
use crate::fingerprint::composite::CompositeFingerprint;

/// Local-first device classifier with optional LLM fallback.
pub struct DeviceClassifier {
    signatures: SignatureDb,
    llm: Option<OpenAiCompatibleClassifier>,
}

impl DeviceClassifier {
    pub fn new(signatures: SignatureDb, llm: Option<OpenAiCompatibleClassifier>) -> Self {
        Self { signatures, llm }
    }

    /// Classify a fingerprint. The local signature DB always answers;
    /// when it comes back Unknown and an LLM endpoint is configured, the
    /// LLM result is used instead. LLM failures (endpoint down, malformed
    /// response) fall back to the local result; values are never invented.
    pub async fn classify(&self, fp: &CompositeFingerprint) -> DeviceClassification {
        let local = self.signatures.classify(fp);
        if local.manufacturer != "Unknown" {
            return local;
        }

        if let Some(llm) = &self.llm {
            match llm.classify(fp).await {
                Ok(result) => return result,
                Err(e) => {
                    log::warn!("LLM classification failed, keeping local result: {e}");
                }
            }
        }

        local
    }

    pub fn signatures(&self) -> &SignatureDb {
        &self.signatures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::signatures::ClassificationSource;
    use crate::fingerprint::composite::compute_fingerprint;

    #[tokio::test]
    async fn test_local_hit_skips_llm() {
        let classifier = DeviceClassifier::new(SignatureDb::bundled(), None);
        let fp = compute_fingerprint(Some("A4:83:E7:11:22:33"), None, None, None, None);
        let result = classifier.classify(&fp).await;
        assert_eq!(result.manufacturer, "Apple");
        assert_eq!(result.source, ClassificationSource::Local);
    }

    #[tokio::test]
    async fn test_unknown_without_llm_stays_unknown() {
        let classifier = DeviceClassifier::new(SignatureDb::empty(), None);
        let fp = compute_fingerprint(Some("02:00:00:11:22:33"), None, None, None, None);
        let result = classifier.classify(&fp).await;
        assert_eq!(result.manufacturer, "Unknown");
        assert_eq!(result.device_type, "unknown");
    }

    #[tokio::test]
    async fn test_unreachable_llm_falls_back_to_local() {
        let llm = OpenAiCompatibleClassifier::new("http://127.0.0.1:1", "test-model", None);
        let classifier = DeviceClassifier::new(SignatureDb::empty(), Some(llm));
        let fp = compute_fingerprint(Some("02:00:00:11:22:33"), None, None, None, None);
        let result = classifier.classify(&fp).await;
        assert_eq!(result.manufacturer, "Unknown");
        assert_eq!(result.source, ClassificationSource::Unknown);
    }
}
