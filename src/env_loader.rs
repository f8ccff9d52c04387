use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DotenvLoadOutcome {
    LoadedDefault,
    LoadedFallback(PathBuf),
    Missing,
}

fn fallback_dotenv_path(
    dutycycle_home: Option<PathBuf>,
    config_dir: Option<PathBuf>,
) -> Option<PathBuf> {
    if let Some(home) = dutycycle_home {
        return Some(home.join(".env"));
    }
    Some(config_dir?.join("dutycycle/.env"))
}

pub fn load_dotenv() -> DotenvLoadOutcome {
    if dotenvy::dotenv().is_ok() {
        return DotenvLoadOutcome::LoadedDefault;
    }

    let fallback = fallback_dotenv_path(
        env::var_os("DUTYCYCLE_HOME").map(PathBuf::from),
        dirs::config_dir(),
    );

    let Some(path) = fallback else {
        return DotenvLoadOutcome::Missing;
    };
    if path.is_file() && dotenvy::from_path(&path).is_ok() {
        return DotenvLoadOutcome::LoadedFallback(path);
    }

    DotenvLoadOutcome::Missing
}
