//! Fluent API for describing a container run.

use berth_common::error::{BerthError, Result};
use berth_common::run_spec::{
    BindMount, DeviceMount, EntrypointScript, EnvVar, ImageMount, Mount, PortSpec, Protocol,
    RunSpec, TmpfsMount, VolumeMount,
};

/// Builder for a [`RunSpec`].
#[derive(Debug, Clone)]
pub struct RunSpecBuilder {
    spec: RunSpec,
}

impl RunSpecBuilder {
    /// Starts a run of `image`.
    #[must_use]
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            spec: RunSpec::new(image),
        }
    }

    /// Names the container.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.spec.name = Some(name.into());
        self
    }

    /// Sets the command to run.
    #[must_use]
    pub fn command<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.spec.process.command = args.into_iter().map(Into::into).collect();
        self
    }

    /// Overrides the image entrypoint.
    #[must_use]
    pub fn entrypoint<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.spec.process.entrypoint = args.into_iter().map(Into::into).collect();
        self
    }

    /// Installs `script` in the container and runs it as the entrypoint.
    /// The command becomes the script's arguments.
    #[must_use]
    pub fn script(mut self, script: impl Into<String>) -> Self {
        self.entrypoint_script().script = script.into();
        self
    }

    /// Runs the entrypoint script with `interpreter` instead of `/bin/sh`.
    #[must_use]
    pub fn interpreter<I, S>(mut self, interpreter: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entrypoint_script().interpreter = interpreter.into_iter().map(Into::into).collect();
        self
    }

    /// Starts the interpreter on its own so it reads the terminal. The
    /// script is still installed.
    #[must_use]
    pub fn interactive(mut self, interactive: bool) -> Self {
        self.entrypoint_script().interactive = interactive;
        self
    }

    fn entrypoint_script(&mut self) -> &mut EntrypointScript {
        self.spec.process.script.get_or_insert_with(EntrypointScript::default)
    }

    /// Runs the process as `user`.
    #[must_use]
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.spec.process.user = user.into();
        self
    }

    /// Sets the working directory.
    #[must_use]
    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.spec.process.working_dir = dir.into();
        self
    }

    /// Adds an environment variable. Repeated keys are kept in order.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.spec.environment.push(EnvVar::new(key, value));
        self
    }

    /// Allocates a pseudo-terminal.
    #[must_use]
    pub const fn tty(mut self, tty: bool) -> Self {
        self.spec.terminal.tty = tty;
        self
    }

    /// Attaches the caller's stdio, making this a foreground run that is
    /// removed on exit.
    #[must_use]
    pub const fn stdio(mut self, stdio: bool) -> Self {
        self.spec.terminal.stdio = stdio;
        self
    }

    /// Publishes a container port. `None` lets the engine pick the host port.
    #[must_use]
    pub fn port(mut self, protocol: Protocol, container_port: u16, host_port: Option<u16>) -> Self {
        self.spec.ports.push(PortSpec {
            protocol,
            container_port,
            host_port,
        });
        self
    }

    /// Bind-mounts a host path.
    #[must_use]
    pub fn bind(
        mut self,
        host_path: impl Into<String>,
        target: impl Into<String>,
        readonly: bool,
    ) -> Self {
        self.spec.mounts.push(Mount::Bind(BindMount {
            host_path: host_path.into(),
            target: target.into(),
            readonly,
        }));
        self
    }

    /// Mounts a named volume.
    #[must_use]
    pub fn volume(
        mut self,
        volume_name: impl Into<String>,
        target: impl Into<String>,
        readonly: bool,
    ) -> Self {
        self.spec.mounts.push(Mount::Volume(VolumeMount {
            volume_name: volume_name.into(),
            target: target.into(),
            readonly,
            subpath: String::new(),
        }));
        self
    }

    /// Mounts an in-memory filesystem. `mode` is octal, e.g. `1777`; empty
    /// keeps the engine default.
    #[must_use]
    pub fn tmpfs(mut self, target: impl Into<String>, size: i64, mode: impl Into<String>) -> Self {
        self.spec.mounts.push(Mount::Tmpfs(TmpfsMount {
            target: target.into(),
            size,
            mode: mode.into(),
        }));
        self
    }

    /// Mounts the filesystem of another image.
    #[must_use]
    pub fn image_mount(
        mut self,
        image: impl Into<String>,
        target: impl Into<String>,
        subpath: impl Into<String>,
    ) -> Self {
        self.spec.mounts.push(Mount::Image(ImageMount {
            image: image.into(),
            target: target.into(),
            readonly: true,
            subpath: subpath.into(),
        }));
        self
    }

    /// Exposes a host device.
    #[must_use]
    pub fn device(
        mut self,
        host_path: impl Into<String>,
        target: impl Into<String>,
        permissions: impl Into<String>,
        cgroup_rule: Option<String>,
    ) -> Self {
        self.spec.mounts.push(Mount::Device(DeviceMount {
            host_path: host_path.into(),
            target: target.into(),
            permissions: permissions.into(),
            cgroup_rule,
        }));
        self
    }

    /// Adds a Linux capability, e.g. `NET_ADMIN`.
    #[must_use]
    pub fn cap_add(mut self, capability: impl Into<String>) -> Self {
        let _ = self.spec.capabilities.insert(capability.into());
        self
    }

    /// Returns the finished run specification.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the image is empty, an environment key is empty
    /// or contains `=`, a port is zero, or a non-interactive entrypoint
    /// script is empty.
    pub fn build(self) -> Result<RunSpec> {
        let invalid = |message: String| Err(BerthError::Config { message });
        if self.spec.image.trim().is_empty() {
            return invalid("image is required".into());
        }
        if let Some(var) = self
            .spec
            .environment
            .iter()
            .find(|v| v.key.is_empty() || v.key.contains('='))
        {
            return invalid(format!("invalid environment variable name {:?}", var.key));
        }
        if self.spec.ports.iter().any(|p| p.container_port == 0) {
            return invalid("container port must not be zero".into());
        }
        let empty_script = self
            .spec
            .process
            .script
            .as_ref()
            .is_some_and(|script| !script.interactive && script.script.trim().is_empty());
        if empty_script {
            return invalid("entrypoint script is empty".into());
        }
        Ok(self.spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_foreground_run() {
        let spec = RunSpecBuilder::new("alpine:3.20")
            .name("hello")
            .command(["echo", "hi"])
            .env("A", "1")
            .env("A", "2")
            .stdio(true)
            .build()
            .expect("valid");

        assert_eq!(spec.image, "alpine:3.20");
        assert_eq!(spec.name.as_deref(), Some("hello"));
        assert_eq!(spec.process.command, vec!["echo", "hi"]);
        assert_eq!(spec.environment.len(), 2);
        assert!(spec.terminal.stdio);
        assert!(!spec.terminal.tty);
    }

    #[test]
    fn mounts_keep_order() {
        let spec = RunSpecBuilder::new("alpine")
            .bind("/src", "/work", true)
            .tmpfs("/run", 1 << 20, "1777")
            .device("/dev/fuse", "/dev/fuse", "rwm", None)
            .build()
            .expect("valid");

        assert!(matches!(spec.mounts[0], Mount::Bind(_)));
        assert!(matches!(spec.mounts[1], Mount::Tmpfs(_)));
        assert!(matches!(spec.mounts[2], Mount::Device(_)));
    }

    #[test]
    fn image_is_required() {
        let err = RunSpecBuilder::new(" ").build().expect_err("no image");
        assert!(matches!(err, BerthError::Config { .. }));
    }

    #[test]
    fn rejects_bad_env_and_ports() {
        assert!(RunSpecBuilder::new("alpine").env("", "x").build().is_err());
        assert!(RunSpecBuilder::new("alpine").env("A=B", "x").build().is_err());
        assert!(
            RunSpecBuilder::new("alpine")
                .port(Protocol::Tcp, 0, None)
                .build()
                .is_err()
        );
    }

    #[test]
    fn script_settings_accumulate() {
        let spec = RunSpecBuilder::new("alpine")
            .interpreter(["/bin/bash", "-e"])
            .script("make test")
            .command(["--jobs", "4"])
            .build()
            .expect("valid");

        let script = spec.process.script.expect("script");
        assert_eq!(script.script, "make test");
        assert_eq!(script.interpreter, vec!["/bin/bash", "-e"]);
        assert!(!script.interactive);
        assert_eq!(spec.process.command, vec!["--jobs", "4"]);
    }

    #[test]
    fn empty_script_needs_interactive() {
        assert!(RunSpecBuilder::new("alpine").interpreter(["/bin/zsh"]).build().is_err());
        assert!(
            RunSpecBuilder::new("alpine")
                .interpreter(["/bin/zsh"])
                .interactive(true)
                .build()
                .is_ok()
        );
    }
}
