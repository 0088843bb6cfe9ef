//! Vision task facade for grounded vision-language models.
//!
//! Wraps the typed request kinds the engine exposes beyond plain
//! generation: visual question answering (`query`), object pointing
//! (`point`), and detection (`detect`), plus captioning as a task-named
//! generation.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::client::{ChatMessage, ChatParams, Client};
use crate::error::Result;
use crate::ipc::wire::RequestType;

/// Default model id for vision tasks.
pub const DEFAULT_VISION_MODEL: &str = "moondream3";

/// A normalized point in `[0, 1]²`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PointCoord {
    pub x: f64,
    pub y: f64,
}

/// A normalized bounding box in `[0, 1]²`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x_min: f64,
    pub y_min: f64,
    pub x_max: f64,
    pub y_max: f64,
}

#[derive(Deserialize)]
struct PointsAnswer {
    #[serde(default)]
    points: Vec<PointCoord>,
}

#[derive(Deserialize)]
struct ObjectsAnswer {
    #[serde(default)]
    objects: Vec<BoundingBox>,
}

/// Client for vision-language tasks against one model.
pub struct VisionClient {
    client: Client,
    model_id: String,
}

impl VisionClient {
    pub fn new(client: Client, model_id: impl Into<String>) -> Self {
        Self {
            client,
            model_id: model_id.into(),
        }
    }

    /// Answer a free-form question about an image.
    pub async fn query(&self, image: &[u8], question: &str) -> Result<String> {
        let response = self
            .client
            .task_request(
                &self.model_id,
                image_conversation(image, question),
                task_params("query"),
                RequestType::Query,
            )
            .await?;
        Ok(response.text)
    }

    /// Describe an image.
    pub async fn caption(&self, image: &[u8]) -> Result<String> {
        let response = self
            .client
            .task_request(
                &self.model_id,
                image_conversation(image, "Describe this image."),
                task_params("caption"),
                RequestType::Generation,
            )
            .await?;
        Ok(response.text)
    }

    /// Point at every instance of `object` in the image.
    pub async fn point(&self, image: &[u8], object: &str) -> Result<Vec<PointCoord>> {
        let response = self
            .client
            .task_request(
                &self.model_id,
                image_conversation(image, object),
                task_params("point"),
                RequestType::Point,
            )
            .await?;

        let answer: PointsAnswer = match serde_json::from_str(&response.text) {
            Ok(answer) => answer,
            Err(e) => {
                log::debug!("unparseable point answer ({}): {}", e, response.text);
                return Ok(Vec::new());
            }
        };
        Ok(answer.points)
    }

    /// Detect every instance of `object`, returning bounding boxes.
    pub async fn detect(&self, image: &[u8], object: &str) -> Result<Vec<BoundingBox>> {
        let response = self
            .client
            .task_request(
                &self.model_id,
                image_conversation(image, object),
                task_params("detect"),
                RequestType::Detect,
            )
            .await?;

        let answer: ObjectsAnswer = match serde_json::from_str(&response.text) {
            Ok(answer) => answer,
            Err(e) => {
                log::debug!("unparseable detect answer ({}): {}", e, response.text);
                return Ok(Vec::new());
            }
        };
        Ok(answer.objects)
    }
}

fn task_params(task: &str) -> ChatParams {
    ChatParams {
        task_name: Some(task.to_string()),
        temperature: 0.0,
        ..Default::default()
    }
}

fn image_conversation(image: &[u8], text: &str) -> Vec<ChatMessage> {
    let data_url = format!("data:image/jpeg;base64,{}", BASE64.encode(image));
    vec![ChatMessage::from([
        ("role".to_string(), json!("user")),
        (
            "content".to_string(),
            json!([
                {"type": "image", "image_url": data_url},
                {"type": "text", "text": text},
            ]),
        ),
    ])]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_conversation_encodes_a_data_url() {
        let messages = image_conversation(&[1, 2, 3], "what is this?");
        assert_eq!(messages.len(), 1);

        let content = messages[0].get("content").unwrap().as_array().unwrap();
        assert_eq!(content.len(), 2);
        let url = content[0].get("image_url").unwrap().as_str().unwrap();
        assert!(url.starts_with("data:image/jpeg;base64,"));
        assert_eq!(content[1].get("text").unwrap(), "what is this?");
    }

    #[test]
    fn point_answers_deserialize() {
        let answer: PointsAnswer =
            serde_json::from_str(r#"{"points": [{"x": 0.5, "y": 0.25}]}"#).unwrap();
        assert_eq!(answer.points.len(), 1);
        assert_eq!(answer.points[0], PointCoord { x: 0.5, y: 0.25 });
    }

    #[test]
    fn detect_answers_deserialize() {
        let answer: ObjectsAnswer = serde_json::from_str(
            r#"{"objects": [{"x_min": 0.1, "y_min": 0.2, "x_max": 0.3, "y_max": 0.4}]}"#,
        )
        .unwrap();
        assert_eq!(answer.objects.len(), 1);
        assert_eq!(answer.objects[0].x_max, 0.3);
    }

    #[test]
    fn task_params_pin_temperature() {
        let params = task_params("point");
        assert_eq!(params.task_name.as_deref(), Some("point"));
        assert_eq!(params.temperature, 0.0);
    }
}
