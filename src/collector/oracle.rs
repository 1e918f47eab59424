use std::time::Duration;

use image::RgbImage;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use reqwest::blocking::Client;
use serde::Deserialize;
use serde_json::json;

use crate::collector::error::{CollectError, CollectResult};

/// One decoded prediction from the validation model.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct Prediction {
    pub(crate) label: String,
    pub(crate) confidence: f32,
}

/// The frozen pretrained classifier behind its capability interface: one
/// batched inference call per filter batch, top-K (label, confidence) pairs
/// per image. No training of the oracle ever occurs here.
pub(crate) trait Oracle {
    fn predict(&self, batch: &[RgbImage]) -> CollectResult<Vec<Vec<Prediction>>>;
}

/// Decides whether a prediction set plausibly belongs to a category.
///
/// The oracle's vocabulary is much finer-grained than the categories (many
/// breed labels all mean "dog"), so matching is case-insensitive substring
/// against the category's accepted-label set. The confidence comparison is
/// strictly greater-than: a prediction at exactly the threshold rejects.
pub(crate) fn matches_category(
    predictions: &[Prediction],
    accepted_labels: &[String],
    threshold: f32,
) -> bool {
    for prediction in predictions {
        if prediction.confidence <= threshold {
            continue;
        }
        let label = prediction.label.to_lowercase();
        if accepted_labels
            .iter()
            .any(|accepted| label.contains(&accepted.to_lowercase()))
        {
            return true;
        }
    }
    false
}

#[derive(Deserialize)]
struct PredictResponse {
    predictions: Vec<Vec<Prediction>>,
}

/// Oracle adapter for a frozen model served over HTTP. Each image is resized
/// to the model's input edge, re-encoded as JPEG, and shipped base64-encoded
/// in a single batched request.
pub(crate) struct RemoteOracle {
    http: Client,
    endpoint: String,
    input_size: u32,
    top_k: usize,
}

impl RemoteOracle {
    pub(crate) fn new(endpoint: &str, input_size: u32, top_k: usize) -> CollectResult<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| CollectError::Config(format!("unable to build oracle client: {e}")))?;

        Ok(RemoteOracle {
            http,
            endpoint: endpoint.to_string(),
            input_size,
            top_k,
        })
    }

    fn encode_input(&self, image: &RgbImage) -> CollectResult<String> {
        let resized = imageops::resize(image, self.input_size, self.input_size, FilterType::Triangle);
        let mut bytes = Vec::new();
        JpegEncoder::new_with_quality(&mut bytes, 90)
            .encode_image(&resized)
            .map_err(|e| CollectError::OracleBatch(format!("unable to encode input: {e}")))?;
        Ok(base64_url::encode(&bytes))
    }
}

impl Oracle for RemoteOracle {
    fn predict(&self, batch: &[RgbImage]) -> CollectResult<Vec<Vec<Prediction>>> {
        let mut images = Vec::with_capacity(batch.len());
        for image in batch {
            images.push(self.encode_input(image)?);
        }

        let response = self
            .http
            .post(&self.endpoint)
            .json(&json!({ "images": images, "topK": self.top_k }))
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| CollectError::OracleBatch(format!("inference request failed: {e}")))?;

        let decoded: PredictResponse = response
            .json()
            .map_err(|e| CollectError::OracleBatch(format!("malformed inference response: {e}")))?;

        if decoded.predictions.len() != batch.len() {
            return Err(CollectError::OracleBatch(format!(
                "oracle returned {} prediction sets for a batch of {}",
                decoded.predictions.len(),
                batch.len()
            )));
        }

        Ok(decoded.predictions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prediction(label: &str, confidence: f32) -> Prediction {
        Prediction {
            label: label.to_string(),
            confidence,
        }
    }

    fn labels(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn accepts_a_confident_matching_label() {
        let predictions = vec![prediction("cat", 0.9)];
        assert!(matches_category(&predictions, &labels(&["cat"]), 0.2));
    }

    #[test]
    fn rejects_a_low_confidence_match() {
        let predictions = vec![prediction("cat", 0.1)];
        assert!(!matches_category(&predictions, &labels(&["cat"]), 0.2));
    }

    #[test]
    fn threshold_is_exclusive() {
        // Exactly at the threshold rejects; just above accepts.
        let at = vec![prediction("cat", 0.2)];
        assert!(!matches_category(&at, &labels(&["cat"]), 0.2));

        let above = vec![prediction("cat", 0.2 + f32::EPSILON)];
        assert!(matches_category(&above, &labels(&["cat"]), 0.2));
    }

    #[test]
    fn matches_are_case_insensitive_substrings() {
        // Fine-grained vocabulary labels map down onto the category.
        let predictions = vec![prediction("Egyptian_Cat", 0.5)];
        assert!(matches_category(&predictions, &labels(&["cat"]), 0.2));

        let predictions = vec![prediction("golden_retriever", 0.5)];
        assert!(matches_category(
            &predictions,
            &labels(&["dog", "golden_retriever"]),
            0.2
        ));
    }

    #[test]
    fn unrelated_labels_never_match() {
        let predictions = vec![
            prediction("catamaran_sail", 0.9),
            prediction("dog", 0.9),
        ];
        // "catamaran_sail" contains "cat" as a substring, which is the
        // accepted recall/precision trade; "dog" must not match "cat".
        assert!(!matches_category(&[prediction("dog", 0.9)], &labels(&["cat"]), 0.2));
        assert!(matches_category(&predictions, &labels(&["cat"]), 0.2));
    }

    #[test]
    fn only_the_matching_label_needs_confidence() {
        let predictions = vec![
            prediction("tabby", 0.05),
            prediction("tiger_cat", 0.3),
            prediction("dog", 0.99),
        ];
        assert!(matches_category(&predictions, &labels(&["tabby", "tiger_cat"]), 0.2));
    }

    #[test]
    fn decodes_a_predict_response() {
        let body = r#"{
            "predictions": [
                [ {"label": "tabby", "confidence": 0.61}, {"label": "tiger_cat", "confidence": 0.22} ],
                [ {"label": "sports_car", "confidence": 0.8} ]
            ]
        }"#;
        let decoded: PredictResponse = serde_json::from_str(body).unwrap();
        assert_eq!(decoded.predictions.len(), 2);
        assert_eq!(decoded.predictions[0][0].label, "tabby");
        assert!((decoded.predictions[1][0].confidence - 0.8).abs() < 1e-6);
    }
}
