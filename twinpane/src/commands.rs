use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::io::AsyncWriteExt;
use tracing::info;
use twinpane_core::{
    Activity, Clients, Entry, NotificationSink, Source, SourceError, SourceProfile, TaskHandle,
    copy_entry, paths,
};
use twinpane_integrations::ids::LOCAL_PROFILE;
use twinpane_integrations::{SizeUnits, TaskAction, format_size, task_name};

use crate::profiles::ProfileStore;
use crate::settings::Settings;

pub const USAGE: &str = "\
Usage: twinpane [--progress] <command> [args]

Locations are written as <profile>:<path>. A bare path uses the local profile,
an empty or relative path is resolved against the profile's home.

Commands:
  ls <location>                 List a directory
  stat <location>               Print entry metadata as JSON
  get <location> <local-path>   Download a file
  put <local-file> <location>   Upload a file into a directory
  copy <location> <location>    Copy a file into a directory of any profile
  mv <location> <new-name>      Rename within the same directory
  mkdir <location>              Create a directory
  rm <location>                 Delete a file or directory tree
  profiles                      List configured profiles
  profiles add <json>           Add or replace a profile, e.g. '{\"name\":\"nas\",\"type\":\"sftp\",...}'
  profiles remove <name>        Delete a profile
  settings                      Print effective settings as JSON
  help                          Show this help

Options:
  -p, --progress                Report overall progress on stderr
";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub profile: String,
    pub path: String,
}

impl Location {
    pub fn parse(raw: &str) -> Self {
        match raw.split_once(':') {
            Some((profile, path))
                if !profile.is_empty() && !profile.contains(['/', '\\', '.']) =>
            {
                Self {
                    profile: profile.to_string(),
                    path: path.to_string(),
                }
            }
            _ => Self {
                profile: LOCAL_PROFILE.to_string(),
                path: raw.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    List(Location),
    Stat(Location),
    Get { from: Location, to: PathBuf },
    Put { from: PathBuf, to: Location },
    Copy { from: Location, to: Location },
    Rename { from: Location, name: String },
    MakeDir(Location),
    Remove(Location),
    Profiles,
    AddProfile(String),
    RemoveProfile(String),
    Settings,
    Help,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub command: Command,
    pub progress: bool,
}

pub fn parse_args<I>(args: I) -> anyhow::Result<Invocation>
where
    I: IntoIterator<Item = String>,
{
    let mut progress = false;
    let mut words = Vec::new();
    for arg in args.into_iter().skip(1) {
        match arg.as_str() {
            "--progress" | "-p" => progress = true,
            "--help" | "-h" => words.insert(0, "help".to_string()),
            other if other.starts_with("--") => bail!("unknown option: {other}"),
            _ => words.push(arg),
        }
    }

    let Some((name, rest)) = words.split_first() else {
        return Ok(Invocation {
            command: Command::Help,
            progress,
        });
    };
    let expect = |count: usize| -> anyhow::Result<()> {
        if rest.len() != count {
            bail!("{name} expects {count} argument(s), got {}", rest.len());
        }
        Ok(())
    };
    let command = match name.as_str() {
        "ls" => {
            let location = rest.first().map(String::as_str).unwrap_or("");
            if rest.len() > 1 {
                bail!("ls expects at most 1 argument");
            }
            Command::List(Location::parse(location))
        }
        "stat" => {
            expect(1)?;
            Command::Stat(Location::parse(&rest[0]))
        }
        "get" => {
            expect(2)?;
            Command::Get {
                from: Location::parse(&rest[0]),
                to: PathBuf::from(&rest[1]),
            }
        }
        "put" => {
            expect(2)?;
            Command::Put {
                from: PathBuf::from(&rest[0]),
                to: Location::parse(&rest[1]),
            }
        }
        "copy" | "cp" => {
            expect(2)?;
            Command::Copy {
                from: Location::parse(&rest[0]),
                to: Location::parse(&rest[1]),
            }
        }
        "mv" | "rename" => {
            expect(2)?;
            Command::Rename {
                from: Location::parse(&rest[0]),
                name: rest[1].clone(),
            }
        }
        "mkdir" => {
            expect(1)?;
            Command::MakeDir(Location::parse(&rest[0]))
        }
        "rm" => {
            expect(1)?;
            Command::Remove(Location::parse(&rest[0]))
        }
        "profiles" => match rest {
            [] => Command::Profiles,
            [verb, json] if verb == "add" => Command::AddProfile(json.clone()),
            [verb, name] if verb == "remove" || verb == "rm" => {
                Command::RemoveProfile(name.clone())
            }
            _ => bail!("usage: profiles [add <json> | remove <name>]"),
        },
        "settings" => Command::Settings,
        "help" => Command::Help,
        other => bail!("unknown command: {other}"),
    };
    Ok(Invocation { command, progress })
}

/// Opens sources on demand and runs commands through the activity tracker.
pub struct App {
    settings: Settings,
    store: ProfileStore,
    clients: Clients,
    activity: Arc<Activity>,
    sources: HashMap<String, Source>,
}

impl App {
    pub fn new(
        settings: Settings,
        store: ProfileStore,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        let clients = settings.clients();
        Self {
            settings,
            store,
            clients,
            activity: Arc::new(Activity::new(notifier)),
            sources: HashMap::new(),
        }
    }

    pub fn activity(&self) -> &Arc<Activity> {
        &self.activity
    }

    fn source(&mut self, name: &str) -> anyhow::Result<Source> {
        if let Some(source) = self.sources.get(name) {
            return Ok(source.clone());
        }
        let profile = self
            .store
            .get(name)
            .with_context(|| format!("unknown profile {name:?}"))?;
        let source = profile
            .open(&self.clients)
            .with_context(|| format!("cannot open profile {name:?}"))?;
        info!(profile = name, kind = %source.kind(), "opened source");
        self.sources.insert(name.to_string(), source.clone());
        Ok(source)
    }

    async fn resolve(&mut self, location: &Location) -> anyhow::Result<(Source, String)> {
        let source = self.source(&location.profile)?;
        let path = if location.path.starts_with(['/', '\\']) {
            paths::canonicalize(&location.path)
        } else {
            let home = source
                .home()
                .await
                .with_context(|| format!("cannot resolve home of {:?}", location.profile))?;
            paths::join(&home, &location.path)
        };
        Ok((source, path))
    }

    /// Runs `command`, writing results to `out`.
    ///
    /// Returns `false` when the command failed with an error that was
    /// reported through the notifier.
    pub async fn execute(&mut self, command: Command, out: &mut dyn Write) -> anyhow::Result<bool> {
        let units = self.settings.size_units;
        match command {
            Command::Help => {
                write!(out, "{USAGE}")?;
                Ok(true)
            }
            Command::Settings => {
                serde_json::to_writer_pretty(&mut *out, &self.settings.snapshot())?;
                writeln!(out)?;
                Ok(true)
            }
            Command::Profiles => {
                for profile in self.store.profiles() {
                    writeln!(out, "{}\t{}", profile.name, profile.config.kind())?;
                }
                Ok(true)
            }
            Command::AddProfile(raw) => {
                let profile: SourceProfile =
                    serde_json::from_str(&raw).context("invalid profile JSON")?;
                if profile.name.is_empty() || profile.name.contains([':', '/', '\\', '.']) {
                    bail!("invalid profile name {:?}", profile.name);
                }
                let name = profile.name.clone();
                self.store.upsert(profile);
                self.store.save().await?;
                if let Some(source) = self.sources.remove(&name) {
                    source.close().await;
                }
                writeln!(out, "saved profile {name}")?;
                Ok(true)
            }
            Command::RemoveProfile(name) => {
                if name == LOCAL_PROFILE {
                    bail!("the {LOCAL_PROFILE} profile is built in");
                }
                if self.store.remove(&name).is_none() {
                    bail!("unknown profile {name:?}");
                }
                self.store.save().await?;
                if let Some(source) = self.sources.remove(&name) {
                    source.close().await;
                }
                writeln!(out, "removed profile {name}")?;
                Ok(true)
            }
            Command::List(location) => {
                let (source, path) = self.resolve(&location).await?;
                let listed = self
                    .activity
                    .run(task_name(TaskAction::List, &path), |_task| async move {
                        let entry = source.get(&path).await?;
                        if entry.is_directory() {
                            entry.list().await
                        } else {
                            Ok(vec![entry])
                        }
                    })
                    .await?;
                let Some(entries) = listed else {
                    return Ok(false);
                };
                for entry in &entries {
                    writeln!(out, "{}", describe(entry, units))?;
                }
                Ok(true)
            }
            Command::Stat(location) => {
                let (source, path) = self.resolve(&location).await?;
                let entry = self
                    .activity
                    .run(task_name(TaskAction::List, &path), |_task| async move {
                        source.get(&path).await
                    })
                    .await?;
                let Some(entry) = entry else {
                    return Ok(false);
                };
                serde_json::to_writer_pretty(&mut *out, entry.meta())?;
                writeln!(out)?;
                Ok(true)
            }
            Command::Get { from, to } => {
                let (source, path) = self.resolve(&from).await?;
                let downloaded = self
                    .activity
                    .run(task_name(TaskAction::Download, &path), |task| async move {
                        let entry = source.get(&path).await?;
                        if entry.is_directory() {
                            return Err(SourceError::InvalidOperation(format!(
                                "cannot download directory {path}"
                            )));
                        }
                        let target = match tokio::fs::metadata(&to).await {
                            Ok(meta) if meta.is_dir() => to.join(entry.name()),
                            _ => to,
                        };
                        let copied = download(&entry, &target, &task).await?;
                        Ok((path, target.display().to_string(), copied))
                    })
                    .await?;
                let Some((path, target, copied)) = downloaded else {
                    return Ok(false);
                };
                writeln!(out, "{path} -> {target} ({})", format_size(copied, units))?;
                Ok(true)
            }
            Command::Put { from, to } => {
                let from = std::path::absolute(&from)
                    .with_context(|| format!("invalid local path {}", from.display()))?;
                let from = Location {
                    profile: LOCAL_PROFILE.to_string(),
                    path: from.display().to_string(),
                };
                self.copy(from, to, TaskAction::Upload, out).await
            }
            Command::Copy { from, to } => self.copy(from, to, TaskAction::Copy, out).await,
            Command::Rename { from, name } => {
                let (source, path) = self.resolve(&from).await?;
                let renamed = self
                    .activity
                    .run(task_name(TaskAction::Rename, &path), |_task| async move {
                        source.get(&path).await?.rename(&name).await
                    })
                    .await?;
                let Some(renamed) = renamed else {
                    return Ok(false);
                };
                writeln!(out, "{renamed}")?;
                Ok(true)
            }
            Command::MakeDir(location) => {
                let (source, path) = self.resolve(&location).await?;
                let Some(parent) = paths::parent(&path) else {
                    bail!("cannot create {path:?}: it has no parent directory");
                };
                let name = paths::file_name(&path).to_string();
                let created = self
                    .activity
                    .run(task_name(TaskAction::CreateDir, &path), |_task| async move {
                        source.get(&parent).await?.create_dir(&name).await
                    })
                    .await?;
                let Some(created) = created else {
                    return Ok(false);
                };
                writeln!(out, "{created}")?;
                Ok(true)
            }
            Command::Remove(location) => {
                let (source, path) = self.resolve(&location).await?;
                let removed = self
                    .activity
                    .run(task_name(TaskAction::Delete, &path), |_task| async move {
                        source.get(&path).await?.delete().await
                    })
                    .await?;
                Ok(removed.is_some())
            }
        }
    }

    async fn copy(
        &mut self,
        from: Location,
        to: Location,
        action: TaskAction,
        out: &mut dyn Write,
    ) -> anyhow::Result<bool> {
        let (from_source, from_path) = self.resolve(&from).await?;
        let (to_source, to_path) = self.resolve(&to).await?;
        let copied = self
            .activity
            .run(task_name(action, &from_path), |task| async move {
                let entry = from_source.get(&from_path).await?;
                let target = to_source.get(&to_path).await?;
                copy_entry(&entry, &target, &task).await
            })
            .await?;
        let Some(created) = copied else {
            return Ok(false);
        };
        writeln!(
            out,
            "{created} ({})",
            format_size(created.size(), self.settings.size_units)
        )?;
        Ok(true)
    }

    pub async fn close(&mut self) {
        for (_, source) in self.sources.drain() {
            source.close().await;
        }
    }
}

/// Downloads into a hidden `.name.part` sibling of `target`, renamed into place once complete.
async fn download(entry: &Entry, target: &Path, task: &TaskHandle) -> Result<u64, SourceError> {
    let display = target.display().to_string();
    let name = target
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let partial = target.with_file_name(format!(".{name}.part"));
    let written = async {
        let mut file = tokio::fs::File::create(&partial)
            .await
            .map_err(|err| SourceError::io(err, &display))?;
        let copied = entry.transfer_to(&mut file, task).await?;
        file.flush().await?;
        file.sync_all().await?;
        Ok::<_, SourceError>(copied)
    }
    .await;
    match written {
        Ok(copied) => {
            tokio::fs::rename(&partial, target)
                .await
                .map_err(|err| SourceError::io(err, &display))?;
            Ok(copied)
        }
        Err(err) => {
            let _ = tokio::fs::remove_file(&partial).await;
            Err(err)
        }
    }
}

fn describe(entry: &Entry, units: SizeUnits) -> String {
    let kind = if entry.is_directory() { 'd' } else { '-' };
    let size = if entry.is_directory() {
        "-".to_string()
    } else {
        format_size(entry.size(), units)
    };
    let modified = match entry.modified() {
        0 => "-".to_string(),
        millis => OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000)
            .ok()
            .and_then(|stamp| stamp.format(&Rfc3339).ok())
            .unwrap_or_else(|| "-".to_string()),
    };
    format!("{kind} {size:>10} {modified:<20} {}", entry.name())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(words: &[&str]) -> Vec<String> {
        std::iter::once("twinpane")
            .chain(words.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn parses_locations() {
        assert_eq!(
            Location::parse("nas:/srv/media"),
            Location {
                profile: "nas".into(),
                path: "/srv/media".into()
            }
        );
        assert_eq!(Location::parse("nas:").path, "");
        assert_eq!(Location::parse("/tmp/a:b").profile, LOCAL_PROFILE);
        assert_eq!(Location::parse("./a:b").profile, LOCAL_PROFILE);
        assert_eq!(Location::parse("notes.txt").path, "notes.txt");
    }

    #[test]
    fn parses_commands() {
        let invocation = parse_args(args(&["-p", "copy", "nas:/a.txt", "local:/tmp"])).unwrap();
        assert!(invocation.progress);
        assert_eq!(
            invocation.command,
            Command::Copy {
                from: Location::parse("nas:/a.txt"),
                to: Location::parse("local:/tmp"),
            }
        );
        assert_eq!(parse_args(args(&[])).unwrap().command, Command::Help);
        assert_eq!(
            parse_args(args(&["ls"])).unwrap().command,
            Command::List(Location::parse(""))
        );
        assert_eq!(
            parse_args(args(&["stat", "--help"])).unwrap().command,
            Command::Help
        );
    }

    #[test]
    fn rejects_bad_arguments() {
        assert!(parse_args(args(&["frobnicate"])).is_err());
        assert!(parse_args(args(&["get", "nas:/a"])).is_err());
        assert!(parse_args(args(&["--verbose", "ls"])).is_err());
        assert!(parse_args(args(&["profiles", "rename", "a"])).is_err());
    }

    #[test]
    fn parses_profile_management() {
        assert_eq!(
            parse_args(args(&["profiles", "add", "{}"])).unwrap().command,
            Command::AddProfile("{}".into())
        );
        assert_eq!(
            parse_args(args(&["profiles", "remove", "nas"])).unwrap().command,
            Command::RemoveProfile("nas".into())
        );
        assert_eq!(
            parse_args(args(&["profiles"])).unwrap().command,
            Command::Profiles
        );
    }
}
