//! Unit tests for image payload handling and the image store

use base64::{engine::general_purpose::STANDARD, Engine};
use dalle_studio::client::GeneratedImage;
use dalle_studio::response::{base64 as payload, ImageStore};

const PNG_BYTES: [u8; 12] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 13];

fn image(data: Vec<u8>) -> GeneratedImage {
    GeneratedImage {
        data,
        content_type: Some("image/png".to_string()),
        revised_prompt: Some("A watercolor cat sitting on a mat".to_string()),
    }
}

#[test]
fn test_base64_decode_payload() {
    let encoded = STANDARD.encode(PNG_BYTES);
    let decoded = payload::decode(&encoded).unwrap();

    assert_eq!(PNG_BYTES.as_slice(), decoded.as_slice());
}

#[tokio::test]
async fn test_save_writes_image_and_sidecar() {
    let dir = tempfile::tempdir().unwrap();
    let store = ImageStore::new(dir.path().join("saved"));

    let path = store
        .save("a cat / on a mat?", "1700000000000001", &image(PNG_BYTES.to_vec()))
        .await
        .unwrap();

    assert_eq!(
        path.file_name().unwrap().to_string_lossy(),
        "a cat _ on a mat_-1700000000000001.png"
    );
    assert_eq!(std::fs::read(&path).unwrap(), PNG_BYTES.to_vec());

    let sidecar = std::fs::read_to_string(path.with_extension("json")).unwrap();
    let metadata: serde_json::Value = serde_json::from_str(&sidecar).unwrap();
    assert_eq!(metadata["prompt"], "a cat / on a mat?");
    assert_eq!(metadata["revised_prompt"], "A watercolor cat sitting on a mat");
}

#[tokio::test]
async fn test_save_uses_detected_extension() {
    let dir = tempfile::tempdir().unwrap();
    let store = ImageStore::new(dir.path());

    let jpeg = vec![0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, 0x4A, 0x46, 0x49, 0x46];
    let path = store.save("photo", "42", &image(jpeg)).await.unwrap();

    assert_eq!(path.extension().unwrap(), "jpg");
}

#[tokio::test]
async fn test_save_truncates_long_prompt() {
    let dir = tempfile::tempdir().unwrap();
    let store = ImageStore::new(dir.path());

    let prompt = "a very long prompt ".repeat(40);
    let path = store.save(&prompt, "7", &image(PNG_BYTES.to_vec())).await.unwrap();

    let name = path.file_name().unwrap().to_string_lossy().to_string();
    assert!(name.ends_with("...-7.png"));
    assert!(path.to_string_lossy().chars().count() <= 200);
    assert!(path.exists());
}
