//! Scratch files for first-boot provisioning.
//!
//! Each create with provisioning content gets its own directory under the
//! scratch base, `<base>/<host_id>-<ulid>-<hex>/cloud-init.yml`. The file is
//! removed after a successful launch and kept after a failed one.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use directories::BaseDirs;
use rand::RngCore;
use thiserror::Error;
use tracing::{debug, info};
use ulid::Ulid;

/// Overrides the scratch base directory.
pub const CLOUD_INIT_DIR_ENV: &str = "COCALC_CONNECTOR_CLOUD_INIT_DIR";

const FILE_NAME: &str = "cloud-init.yml";

/// Where a shell script is placed inside the guest.
const BOOTSTRAP_PATH: &str = "/root/cocalc-bootstrap.sh";

/// Errors preparing provisioning files.
#[derive(Debug, Error)]
pub enum CloudInitError {
    #[error("could not determine home directory for cloud-init files")]
    NoHomeDir,

    #[error("failed to write cloud-init file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// How provisioning content is handed to the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    /// Already a `#cloud-config` document; used as is.
    CloudConfig,
    /// Starts with `#!`; wrapped to run at first boot.
    Script,
    /// Anything else; wrapped and run with bash.
    Plain,
}

impl ContentKind {
    pub fn classify(content: &str) -> Self {
        let head = content.trim_start();
        if head.starts_with("#cloud-config") {
            ContentKind::CloudConfig
        } else if head.starts_with("#!") {
            ContentKind::Script
        } else {
            ContentKind::Plain
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ContentKind::CloudConfig => "cloud-config",
            ContentKind::Script => "script",
            ContentKind::Plain => "plain",
        }
    }
}

/// The document written for `content`.
pub fn render(content: &str) -> String {
    match ContentKind::classify(content) {
        ContentKind::CloudConfig => content.to_string(),
        ContentKind::Script | ContentKind::Plain => wrap_script(content),
    }
}

/// Embed a script as a root-owned file plus a `runcmd` that runs it.
fn wrap_script(script: &str) -> String {
    let body = script
        .trim_end_matches([' ', '\t', '\r', '\n'])
        .split('\n')
        .map(|line| format!("      {line}"))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "#cloud-config\n\
         write_files:\n  \
         - path: {BOOTSTRAP_PATH}\n    \
         permissions: \"0700\"\n    \
         owner: root:root\n    \
         content: |\n\
         {body}\n\
         runcmd:\n  \
         - [ \"/bin/bash\", \"{BOOTSTRAP_PATH}\" ]\n"
    )
}

/// A written provisioning file.
#[derive(Debug)]
pub struct CloudInitFile {
    path: PathBuf,
    dir: PathBuf,
    kind: ContentKind,
    /// Directories this write created, outermost first.
    created: Vec<PathBuf>,
}

impl CloudInitFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> ContentKind {
        self.kind
    }
}

/// Creates and removes provisioning scratch files.
#[derive(Debug, Clone)]
pub struct CloudInitPackager {
    base: PathBuf,
    /// The base came from [`CLOUD_INIT_DIR_ENV`]; its parent is never touched.
    overridden: bool,
}

impl CloudInitPackager {
    /// Base from the environment, else `~/cocalc-connector/cloud-init`.
    pub fn from_env() -> Result<Self, CloudInitError> {
        if let Some(dir) = std::env::var_os(CLOUD_INIT_DIR_ENV).filter(|v| !v.is_empty()) {
            return Ok(Self::new(PathBuf::from(dir), true));
        }
        let home = BaseDirs::new()
            .map(|dirs| dirs.home_dir().to_path_buf())
            .ok_or(CloudInitError::NoHomeDir)?;
        Ok(Self::new(
            home.join("cocalc-connector").join("cloud-init"),
            false,
        ))
    }

    pub fn new(base: PathBuf, overridden: bool) -> Self {
        Self { base, overridden }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Write `content` for `host_id` into a fresh scratch directory.
    pub fn write(&self, host_id: &str, content: &str) -> Result<CloudInitFile, CloudInitError> {
        let kind = ContentKind::classify(content);
        let document = render(content);

        let mut created = Vec::new();
        if !self.overridden {
            if let Some(parent) = self.base.parent().filter(|p| !p.exists()) {
                created.push(parent.to_path_buf());
            }
        }
        if !self.base.exists() {
            created.push(self.base.clone());
        }
        fs::create_dir_all(&self.base).map_err(|source| CloudInitError::Io {
            path: self.base.clone(),
            source,
        })?;

        let dir = self.base.join(scratch_name(host_id));
        create_private_dir(&dir).map_err(|source| CloudInitError::Io {
            path: dir.clone(),
            source,
        })?;

        let path = dir.join(FILE_NAME);
        write_private_file(&path, document.as_bytes()).map_err(|source| CloudInitError::Io {
            path: path.clone(),
            source,
        })?;

        info!(
            path = %path.display(),
            bytes = document.len(),
            mode = "0600",
            kind = kind.as_str(),
            "Wrote cloud-init file"
        );

        Ok(CloudInitFile {
            path,
            dir,
            kind,
            created,
        })
    }

    /// Remove a file after a successful launch, along with any now-empty
    /// directories this packager created for it.
    pub fn cleanup(&self, file: CloudInitFile) {
        let _ = fs::remove_file(&file.path);
        let _ = fs::remove_dir(&file.dir);
        for dir in file.created.iter().rev() {
            // Fails on non-empty directories, which is what we want.
            if fs::remove_dir(dir).is_ok() {
                debug!(path = %dir.display(), "Removed empty cloud-init directory");
            }
        }
        debug!(path = %file.path.display(), "Removed cloud-init file");
    }
}

fn scratch_name(host_id: &str) -> String {
    let mut suffix = [0u8; 6];
    rand::rng().fill_bytes(&mut suffix);
    format!("{host_id}-{}-{}", Ulid::new(), hex::encode(suffix))
}

fn create_private_dir(path: &Path) -> io::Result<()> {
    let mut builder = fs::DirBuilder::new();
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(path)
}

fn write_private_file(path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(contents)?;
    file.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tempfile::tempdir;

    #[rstest]
    #[case("#cloud-config\npackages: [git]\n", ContentKind::CloudConfig)]
    #[case("\n  #cloud-config\n", ContentKind::CloudConfig)]
    #[case("#!/bin/bash\necho hi\n", ContentKind::Script)]
    #[case("apt-get install -y git", ContentKind::Plain)]
    #[case("", ContentKind::Plain)]
    fn test_classify(#[case] content: &str, #[case] kind: ContentKind) {
        assert_eq!(ContentKind::classify(content), kind);
    }

    #[test]
    fn test_cloud_config_passes_through() {
        let content = "  #cloud-config\r\nruncmd:\n  - echo hi   \n\n";
        assert_eq!(render(content), content);
    }

    #[test]
    fn test_script_is_wrapped() {
        let rendered = render("#!/bin/bash\nset -e\n\necho ready  \n\n");
        assert_eq!(
            rendered,
            "#cloud-config\n\
             write_files:\n\
             \x20 - path: /root/cocalc-bootstrap.sh\n\
             \x20   permissions: \"0700\"\n\
             \x20   owner: root:root\n\
             \x20   content: |\n\
             \x20     #!/bin/bash\n\
             \x20     set -e\n\
             \x20     \n\
             \x20     echo ready\n\
             runcmd:\n\
             \x20 - [ \"/bin/bash\", \"/root/cocalc-bootstrap.sh\" ]\n"
        );
    }

    #[test]
    fn test_write_and_cleanup_removes_created_dirs() {
        let root = tempdir().unwrap();
        let base = root.path().join("cocalc-connector").join("cloud-init");
        let packager = CloudInitPackager::new(base.clone(), false);

        let file = packager.write("h1", "echo hi").unwrap();
        assert_eq!(file.kind(), ContentKind::Plain);
        assert!(file.path().ends_with(FILE_NAME));
        let dir_name = file
            .path()
            .parent()
            .unwrap()
            .file_name()
            .unwrap()
            .to_string_lossy()
            .into_owned();
        assert!(dir_name.starts_with("h1-"));
        assert_eq!(dir_name.len(), "h1-".len() + 26 + 1 + 12);
        assert!(fs::read_to_string(file.path()).unwrap().contains("      echo hi\n"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let file_mode = fs::metadata(file.path()).unwrap().permissions().mode();
            assert_eq!(file_mode & 0o777, 0o600);
            let dir_mode = fs::metadata(file.path().parent().unwrap())
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(dir_mode & 0o777, 0o700);
        }

        packager.cleanup(file);
        assert!(!base.exists());
        assert!(!root.path().join("cocalc-connector").exists());
        assert!(root.path().exists());
    }

    #[test]
    fn test_cleanup_keeps_preexisting_and_busy_dirs() {
        let root = tempdir().unwrap();
        let base = root.path().join("scratch");
        fs::create_dir_all(&base).unwrap();
        let packager = CloudInitPackager::new(base.clone(), true);

        let first = packager.write("h1", "#cloud-config\n").unwrap();
        let second = packager.write("h1", "#cloud-config\n").unwrap();
        assert_ne!(first.path(), second.path());

        packager.cleanup(first);
        assert!(second.path().exists());
        packager.cleanup(second);
        assert!(base.exists());
    }
}
