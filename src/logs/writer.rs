use crate::config::{ProcessSpec, SupervisorSettings};
use crate::error::{Result, VigilError};
use crate::logs::{LogOrigin, LogSink, LogStream};
use async_trait::async_trait;
use chrono::Local;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Per-spec file overrides
#[derive(Debug, Clone)]
struct LogRoute {
    out_file: Option<PathBuf>,
    error_file: Option<PathBuf>,
    merge: bool,
    date_format: Option<String>,
}

/// Appends timestamped lines to per-instance (or per-spec, when merged) files
pub struct FileLogSink {
    log_dir: PathBuf,
    date_format: String,
    routes: HashMap<String, LogRoute>,
    files: Mutex<HashMap<PathBuf, File>>,
}

impl FileLogSink {
    /// Create a sink writing under `settings.log_dir`, honoring each spec's
    /// `out_file` / `error_file` / `merge_logs`
    pub async fn new(settings: &SupervisorSettings, specs: &[ProcessSpec]) -> Result<Self> {
        tokio::fs::create_dir_all(&settings.log_dir)
            .await
            .map_err(|e| VigilError::Log(format!("Failed to create log directory: {}", e)))?;

        let routes = specs
            .iter()
            .map(|spec| {
                (
                    spec.name.clone(),
                    LogRoute {
                        out_file: spec.out_file.clone(),
                        error_file: spec.error_file.clone(),
                        merge: spec.merge_logs || spec.instances == 1,
                        date_format: spec.log_date_format.clone(),
                    },
                )
            })
            .collect();

        Ok(Self {
            log_dir: settings.log_dir.clone(),
            date_format: settings.log_date_format.clone(),
            routes,
            files: Mutex::new(HashMap::new()),
        })
    }

    /// Resolve the file a line from `origin` on `stream` goes to
    pub fn path_for(&self, origin: &LogOrigin, stream: LogStream) -> PathBuf {
        let route = self.routes.get(&origin.spec_name);
        let configured = route.and_then(|r| match stream {
            LogStream::Stdout => r.out_file.as_ref(),
            LogStream::Stderr => r.error_file.as_ref(),
        });

        match configured {
            Some(path) if route.is_some_and(|r| r.merge) => path.clone(),
            Some(path) => with_instance_suffix(path, origin.instance_index),
            None => {
                let suffix = match stream {
                    LogStream::Stdout => "out",
                    LogStream::Stderr => "err",
                };
                self.log_dir
                    .join(format!("{}-{}.log", origin.instance_id, suffix))
            }
        }
    }

    /// Format a log entry: `[timestamp] line\n`, using the spec's date format if it has one
    fn format_log_entry(&self, origin: &LogOrigin, line: &str) -> String {
        let date_format = self
            .routes
            .get(&origin.spec_name)
            .and_then(|r| r.date_format.as_deref())
            .unwrap_or(self.date_format.as_str());
        let timestamp = Local::now().format(date_format);
        format!("[{}] {}\n", timestamp, line.trim_end_matches(['\r', '\n']))
    }

    async fn open(path: &Path) -> Result<File> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| VigilError::Log(format!("Failed to create log directory: {}", e)))?;
        }

        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| {
                VigilError::Log(format!("Failed to open log file {}: {}", path.display(), e))
            })
    }

    /// Flush every open file
    pub async fn flush_all(&self) -> Result<()> {
        let mut files = self.files.lock().await;
        for file in files.values_mut() {
            file.flush()
                .await
                .map_err(|e| VigilError::Log(format!("Failed to flush log: {}", e)))?;
        }
        Ok(())
    }
}

#[async_trait]
impl LogSink for FileLogSink {
    async fn write_line(&self, origin: &LogOrigin, stream: LogStream, line: &str) -> Result<()> {
        let path = self.path_for(origin, stream);
        let entry = self.format_log_entry(origin, line);

        let mut files = self.files.lock().await;
        if !files.contains_key(&path) {
            let file = Self::open(&path).await?;
            files.insert(path.clone(), file);
        }

        let file = files
            .get_mut(&path)
            .ok_or_else(|| VigilError::Log(format!("Log file vanished: {}", path.display())))?;

        file.write_all(entry.as_bytes())
            .await
            .map_err(|e| VigilError::Log(format!("Failed to write to log: {}", e)))?;

        file.flush()
            .await
            .map_err(|e| VigilError::Log(format!("Failed to flush log: {}", e)))?;

        Ok(())
    }
}

/// `logs/out.log` -> `logs/out-1.log`
fn with_instance_suffix(path: &Path, index: usize) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{}-{}.{}", stem, index, ext.to_string_lossy()),
        None => format!("{}-{}", stem, index),
    };
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn settings(dir: &Path) -> SupervisorSettings {
        SupervisorSettings {
            log_dir: dir.to_path_buf(),
            ..SupervisorSettings::default()
        }
    }

    fn origin(spec: &str, instance: &str, index: usize) -> LogOrigin {
        LogOrigin {
            spec_name: spec.to_string(),
            instance_id: instance.to_string(),
            instance_index: index,
        }
    }

    #[tokio::test]
    async fn test_default_paths() {
        let temp_dir = TempDir::new().unwrap();
        let spec = ProcessSpec::new("bot", "python");
        let sink = FileLogSink::new(&settings(temp_dir.path()), &[spec])
            .await
            .unwrap();

        let o = origin("bot", "bot", 0);
        assert_eq!(
            sink.path_for(&o, LogStream::Stdout),
            temp_dir.path().join("bot-out.log")
        );
        assert_eq!(
            sink.path_for(&o, LogStream::Stderr),
            temp_dir.path().join("bot-err.log")
        );
    }

    #[tokio::test]
    async fn test_configured_files_per_instance_and_merged() {
        let temp_dir = TempDir::new().unwrap();

        let mut split = ProcessSpec::new("worker", "/bin/sleep");
        split.instances = 2;
        split.out_file = Some(temp_dir.path().join("worker.log"));

        let mut merged = split.clone();
        merged.name = "api".to_string();
        merged.out_file = Some(temp_dir.path().join("pm2-api-out.log"));
        merged.merge_logs = true;

        let sink = FileLogSink::new(&settings(temp_dir.path()), &[split, merged])
            .await
            .unwrap();

        assert_eq!(
            sink.path_for(&origin("worker", "worker-1", 1), LogStream::Stdout),
            temp_dir.path().join("worker-1.log")
        );
        assert_eq!(
            sink.path_for(&origin("api", "api-1", 1), LogStream::Stdout),
            temp_dir.path().join("pm2-api-out.log")
        );
    }

    #[tokio::test]
    async fn test_timestamped_entries() {
        let temp_dir = TempDir::new().unwrap();
        let spec = ProcessSpec::new("bot", "python");
        let sink = FileLogSink::new(&settings(temp_dir.path()), &[spec])
            .await
            .unwrap();

        let o = origin("bot", "bot", 0);
        sink.write_line(&o, LogStream::Stdout, "Line 1").await.unwrap();
        sink.write_line(&o, LogStream::Stdout, "Line 2\n").await.unwrap();
        sink.write_line(&o, LogStream::Stderr, "Error message").await.unwrap();
        sink.flush_all().await.unwrap();

        let content = tokio::fs::read_to_string(sink.path_for(&o, LogStream::Stdout))
            .await
            .unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in &lines {
            assert!(line.starts_with('['));
            assert!(line.contains("] Line"));
        }

        let errors = tokio::fs::read_to_string(sink.path_for(&o, LogStream::Stderr))
            .await
            .unwrap();
        assert!(errors.contains("Error message"));
    }

    #[tokio::test]
    async fn test_spec_date_format_overrides_default() {
        let temp_dir = TempDir::new().unwrap();
        let mut spec = ProcessSpec::new("bot", "python");
        spec.log_date_format = Some("bot-%Y".to_string());
        let specs = [spec, ProcessSpec::new("api", "python")];
        let sink = FileLogSink::new(&settings(temp_dir.path()), &specs)
            .await
            .unwrap();

        let entry = sink.format_log_entry(&origin("bot", "bot", 0), "ready");
        assert!(entry.starts_with("[bot-"));
        assert!(entry.ends_with("] ready\n"));

        let entry = sink.format_log_entry(&origin("api", "api", 0), "ready");
        assert!(!entry.starts_with("[bot-"));
    }

    #[test]
    fn test_with_instance_suffix() {
        assert_eq!(
            with_instance_suffix(Path::new("logs/out.log"), 1),
            PathBuf::from("logs/out-1.log")
        );
        assert_eq!(
            with_instance_suffix(Path::new("logs/out"), 0),
            PathBuf::from("logs/out-0")
        );
    }
}
