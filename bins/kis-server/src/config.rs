use clap::{Args, Parser, Subcommand};

use kis_core::KisConfig;

use crate::error::ServerError;

#[derive(Parser)]
#[command(name = "kis-server", about = "Приём, архивирование и backfill логов Kong")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Запустить HTTP сервер приёма логов
    Serve(ServeArgs),
    /// Загрузить архивы из object store в БД и выйти
    Backfill(BackfillArgs),
}

/// Общие параметры подкоманд. Всё, что задано здесь, перекрывает config файл.
#[derive(Args, Clone, Debug)]
pub struct CommonArgs {
    /// Путь к TOML конфиг файлу
    #[arg(long, default_value = "config.toml", env = "KIS_CONFIG")]
    pub config: String,

    #[arg(long, env = "KIS_ARCHIVE_ACCESS_KEY_ID", hide_env_values = true)]
    pub access_key_id: Option<String>,

    #[arg(long, env = "KIS_ARCHIVE_SECRET_ACCESS_KEY", hide_env_values = true)]
    pub secret_access_key: Option<String>,

    /// Endpoint S3-совместимого хранилища
    #[arg(long, env = "KIS_ARCHIVE_ENDPOINT")]
    pub endpoint: Option<String>,

    #[arg(long, env = "KIS_DATABASE_CONNECTION_STRING", hide_env_values = true)]
    pub connection_string: Option<String>,
}

#[derive(Args, Clone, Debug)]
pub struct ServeArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Адрес для прослушивания, напр. 0.0.0.0:8080
    #[arg(long, env = "KIS_ADDRESS")]
    pub address: Option<String>,
}

#[derive(Args, Clone, Debug)]
pub struct BackfillArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Сколько архивов обрабатывать параллельно
    #[arg(long)]
    pub parallelism: Option<usize>,

    /// Префикс ключей вместо `[archive] folder`
    #[arg(long)]
    pub folder: Option<String>,
}

// ═══════════════════════════════════════════════════════════════
//  Effective: config file < env/CLI
// ═══════════════════════════════════════════════════════════════

/// Загрузить config файл (если файла нет, берутся дефолты) и применить
/// переопределения из `args`.
pub fn effective(args: &CommonArgs) -> Result<KisConfig, ServerError> {
    let mut config = match KisConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            if std::path::Path::new(&args.config).exists() {
                return Err(e.into());
            }
            tracing::warn!(config = %args.config, "config file not found, using defaults");
            KisConfig::default()
        }
    };

    if let Some(v) = &args.access_key_id {
        config.archive.access_key_id = Some(v.clone());
    }
    if let Some(v) = &args.secret_access_key {
        config.archive.secret_access_key = Some(v.clone());
    }
    if let Some(v) = &args.endpoint {
        config.archive.endpoint = Some(v.clone());
    }
    if let Some(v) = &args.connection_string {
        config.database.connection_string = v.clone();
    }
    Ok(config)
}

impl ServeArgs {
    pub fn effective(&self) -> Result<KisConfig, ServerError> {
        let mut config = effective(&self.common)?;
        if let Some(address) = &self.address {
            config.server.address = address.clone();
        }
        config.validate()?;
        Ok(config)
    }
}

impl BackfillArgs {
    pub fn effective(&self) -> Result<KisConfig, ServerError> {
        let mut config = effective(&self.common)?;
        if let Some(p) = self.parallelism {
            config.database.backfill_parallelism = p;
        }
        if let Some(folder) = &self.folder {
            config.archive.folder = folder.clone();
        }
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn common(config: &str) -> CommonArgs {
        CommonArgs {
            config: config.into(),
            access_key_id: None,
            secret_access_key: None,
            endpoint: None,
            connection_string: None,
        }
    }

    #[test]
    fn cli_overrides_file() {
        let dir = std::env::temp_dir().join(format!("kis-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(
            &path,
            "[server]\naddress = \"127.0.0.1:1\"\n[database]\nconnection_string = \"postgres://file\"\n",
        )
        .unwrap();

        let mut args = ServeArgs {
            common: common(path.to_str().unwrap()),
            address: Some("127.0.0.1:2".into()),
        };
        args.common.connection_string = Some("postgres://cli".into());

        let config = args.effective().unwrap();
        assert_eq!(config.server.address, "127.0.0.1:2");
        assert_eq!(config.database.connection_string, "postgres://cli");

        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let args = BackfillArgs {
            common: common("/nonexistent/kis.toml"),
            parallelism: Some(2),
            folder: None,
        };
        let config = args.effective().unwrap();
        assert_eq!(config.database.backfill_parallelism, 2);
        assert_eq!(config.file.name, "kong.log");
    }

    #[test]
    fn cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["kis-server", "backfill", "--parallelism", "8", "--config", "x.toml"]).unwrap();
        match cli.command {
            Commands::Backfill(args) => {
                assert_eq!(args.parallelism, Some(8));
                assert_eq!(args.common.config, "x.toml");
            }
            Commands::Serve(_) => panic!("expected backfill"),
        }
    }
}
