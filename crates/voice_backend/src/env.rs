use anyhow::{anyhow, Context as _, Result};
use std::path::Path;

/// Loads `.env.toml` from the working directory into the process environment.
pub fn load_dotenv() -> Result<()> {
    load_dotenv_from(Path::new(".env.toml"))
}

pub fn load_dotenv_from(path: &Path) -> Result<()> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("no {} file found", path.display()))?;
    for (key, value) in parse_dotenv(&contents)? {
        // Variables that are already set win over the file.
        if std::env::var_os(&key).is_none() {
            std::env::set_var(key, value);
        }
    }
    Ok(())
}

fn parse_dotenv(contents: &str) -> Result<Vec<(String, String)>> {
    let env: toml::map::Map<String, toml::Value> = toml::from_str(contents)?;
    env.into_iter()
        .map(|(key, value)| {
            let value = match value {
                toml::Value::String(value) => value,
                toml::Value::Integer(value) => value.to_string(),
                toml::Value::Float(value) => value.to_string(),
                toml::Value::Boolean(value) => value.to_string(),
                _ => return Err(anyhow!("unsupported TOML value in .env.toml for key {key}")),
            };
            Ok((key, value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_dotenv() {
        let env = parse_dotenv(indoc! {r#"
            DATABASE_URL = "postgres://postgres@localhost/voice"
            HTTP_PORT = 8080
            LOG_JSON = true
        "#})
        .unwrap();

        assert_eq!(
            env,
            vec![
                (
                    "DATABASE_URL".to_string(),
                    "postgres://postgres@localhost/voice".to_string()
                ),
                ("HTTP_PORT".to_string(), "8080".to_string()),
                ("LOG_JSON".to_string(), "true".to_string()),
            ]
        );

        assert!(parse_dotenv("ALLOWED_ORIGINS = [\"a\", \"b\"]").is_err());
    }
}
