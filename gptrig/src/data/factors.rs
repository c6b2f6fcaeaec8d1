use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use log::info;

use gpcore::algorithm::extrapolation::{ExtrapolationFactor, ExtrapolationFactorTable};
use gpcore::Error;

use crate::data::patterns::open_input;
use crate::error::Result;

/// Load the extrapolation factor table; an empty path means "no table".
pub fn load_factors(path: &str) -> Result<Option<ExtrapolationFactorTable>> {
    if path.trim().is_empty() {
        return Ok(None);
    }
    let f = BufReader::new(open_input(Path::new(path))?);
    let entries: Vec<ExtrapolationFactor> = serde_json::from_reader(f)
        .map_err(|e| Error::Configuration(format!("extrapolation factors `{}`: {}", path, e)))?;
    let table = ExtrapolationFactorTable::from_entries(entries)?;
    info!("loaded {} extrapolation factors from {}", table.len(), path);
    Ok(Some(table))
}

pub fn save_factors(path: &Path, table: &ExtrapolationFactorTable) -> Result<()> {
    let f = File::create(path)?;
    serde_json::to_writer_pretty(f, table.entries())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RunError;

    #[test]
    fn test_empty_path_is_none() {
        assert!(load_factors("").unwrap().is_none());
        assert!(load_factors("  ").unwrap().is_none());
    }

    #[test]
    fn test_bad_factor_files_are_configuration_errors() {
        let missing = std::env::temp_dir().join("gptrig_factors_missing.json");
        let _ = std::fs::remove_file(&missing);
        let err = load_factors(missing.to_str().unwrap()).unwrap_err();
        assert!(matches!(err, RunError::Core(Error::Configuration(_))));

        let path = std::env::temp_dir().join("gptrig_factors_garbage.json");
        std::fs::write(&path, r#"[{"ref_layer": 0}]"#).unwrap();
        let err = load_factors(path.to_str().unwrap()).unwrap_err();
        assert!(matches!(err, RunError::Core(Error::Configuration(_))));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_factor_file() {
        let path = std::env::temp_dir().join("gptrig_factors.json");
        std::fs::write(
            &path,
            r#"[{"ref_layer": 0, "target_layer": 2, "scale": 0.75, "offset": -3},
                {"ref_layer": 0, "target_layer": 2, "quality_bucket": 1, "scale": 0.5}]"#,
        )
        .unwrap();
        let table = load_factors(path.to_str().unwrap()).unwrap().unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(0, 2, 0).unwrap().offset, -3);
        assert_eq!(table.get(0, 2, 1).unwrap().scale, 0.5);
        let _ = std::fs::remove_file(&path);
    }
}
