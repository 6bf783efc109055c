use std::path::Path;

use tracing::info;

use crate::readings::RawReadings;

/// Write `readings` to `path` as pretty-printed JSON, creating parent directories as needed.
pub async fn write_json(path: &Path, readings: &RawReadings) -> crate::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }

    info!(path = %path.display(), readings = readings.len(), "Writing JSON dump");
    let json = serde_json::to_vec_pretty(readings)?;
    tokio::fs::write(path, json).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modbus::register::PointType;
    use crate::readings::RawReading;
    use rust_decimal::Decimal;
    use serde_json::json;

    #[tokio::test]
    async fn writes_readings_keyed_by_model_and_point() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("agate_dump.json");

        let readings: RawReadings = [
            (
                "701/W".to_owned(),
                RawReading {
                    model: 701,
                    instance: 0,
                    point: "W",
                    kind: PointType::Int16,
                    value: Decimal::from(1500),
                    scale_factor: Some("W_SF"),
                },
            ),
            (
                "701/W_SF".to_owned(),
                RawReading {
                    model: 701,
                    instance: 0,
                    point: "W_SF",
                    kind: PointType::Sunssf,
                    value: Decimal::from(-1),
                    scale_factor: None,
                },
            ),
        ]
        .into_iter()
        .collect();

        write_json(&path, &readings).await.unwrap();

        let written: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(
            written,
            json!({
                "701/W": { "type": "int16", "value": 1500.0, "scale_factor": "W_SF" },
                "701/W_SF": { "type": "sunssf", "value": -1.0 },
            })
        );
    }
}
