use crate::error::{Result, RjError};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A catalog entry. Read-only after load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Track {
    pub id: String,
    pub title: String,
    pub artist: String,
    #[serde(alias = "youtube_url")]
    pub url: String,
    pub duration_sec: u32,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_energy")]
    pub energy: f64,
    #[serde(default = "default_mood")]
    pub mood: String,
    #[serde(default = "default_language")]
    pub language: String,
}

fn default_energy() -> f64 {
    0.5
}

fn default_mood() -> String {
    "neutral".to_string()
}

fn default_language() -> String {
    "en".to_string()
}

/// Load and validate the catalog file (a JSON array of tracks).
pub fn load_catalog(path: &Path) -> Result<Vec<Track>> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        RjError::CatalogInvalid(format!("cannot read {}: {}", path.display(), e))
    })?;

    let tracks: Vec<Track> = serde_json::from_str(&raw)
        .map_err(|e| RjError::CatalogInvalid(format!("malformed JSON: {}", e)))?;

    for track in &tracks {
        if track.id.is_empty() {
            return Err(RjError::CatalogInvalid("track with empty id".to_string()));
        }
        if track.duration_sec == 0 {
            return Err(RjError::CatalogInvalid(format!(
                "track {} has non-positive duration",
                track.id
            )));
        }
        if !(0.0..=1.0).contains(&track.energy) {
            return Err(RjError::CatalogInvalid(format!(
                "track {} energy {} outside [0, 1]",
                track.id, track.energy
            )));
        }
    }

    Ok(tracks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_catalog(json: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(json.as_bytes()).expect("write catalog");
        file
    }

    #[test]
    fn loads_catalog_with_defaults() {
        let file = write_catalog(
            r#"[{"id":"t1","title":"One","artist":"A","url":"https://x/1","duration_sec":180}]"#,
        );
        let tracks = load_catalog(file.path()).expect("catalog loads");
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].mood, "neutral");
        assert_eq!(tracks[0].language, "en");
        assert!(tracks[0].tags.is_empty());
        assert_eq!(tracks[0].energy, 0.5);
    }

    #[test]
    fn accepts_youtube_url_alias() {
        let file = write_catalog(
            r#"[{"id":"t1","title":"One","artist":"A","youtube_url":"https://x/1","duration_sec":60}]"#,
        );
        let tracks = load_catalog(file.path()).expect("catalog loads");
        assert_eq!(tracks[0].url, "https://x/1");
    }

    #[test]
    fn rejects_energy_out_of_range() {
        let file = write_catalog(
            r#"[{"id":"t1","title":"One","artist":"A","url":"u","duration_sec":60,"energy":1.5}]"#,
        );
        let err = load_catalog(file.path()).unwrap_err();
        assert!(matches!(err, RjError::CatalogInvalid(_)));
    }

    #[test]
    fn rejects_zero_duration() {
        let file = write_catalog(
            r#"[{"id":"t1","title":"One","artist":"A","url":"u","duration_sec":0}]"#,
        );
        assert!(matches!(
            load_catalog(file.path()),
            Err(RjError::CatalogInvalid(_))
        ));
    }
}
