//! Generated build artifacts
//!
//! Renders the Dockerfile and the startup script that run the application
//! next to its tunnel agent inside one instance.

/// Dockerfile name inside the build context
pub const DOCKERFILE: &str = "Dockerfile";
/// Startup script name
pub const START_SCRIPT: &str = "deployify-start.sh";
/// Tunnel agent config name
pub const AGENT_CONFIG: &str = "tunnel.yml";

/// Files the pipeline writes into every build context
pub const GENERATED_FILES: &[&str] = &[DOCKERFILE, START_SCRIPT, AGENT_CONFIG];

/// Inputs for the generated Dockerfile
#[derive(Debug, Clone)]
pub struct DockerfileSpec<'a> {
    pub base_image: &'a str,
    /// Directory the context is copied into
    pub workdir: &'a str,
    /// Copy every uploaded file, not just the generated ones
    pub copy_sources: bool,
    pub install_step: Option<&'a str>,
    /// Installs the tunnel agent and socat
    pub agent_install: &'a str,
    pub internal_port: u16,
    pub exposed_port: u16,
}

pub fn render_dockerfile(spec: &DockerfileSpec<'_>) -> String {
    let mut lines = vec![
        format!("FROM {}", spec.base_image),
        "USER root".to_string(),
        format!("RUN {}", spec.agent_install),
        format!("WORKDIR {}", spec.workdir),
    ];
    if spec.copy_sources {
        lines.push(format!("COPY . {}", spec.workdir));
    } else {
        lines.push(format!(
            "COPY {} {} {}/",
            START_SCRIPT, AGENT_CONFIG, spec.workdir
        ));
    }
    if let Some(step) = spec.install_step {
        lines.push(format!("RUN {}", step));
    }
    lines.push(format!("ENV PORT={}", spec.internal_port));
    lines.push(format!("EXPOSE {}", spec.exposed_port));
    lines.push("ENTRYPOINT []".to_string());
    lines.push(format!(
        "CMD [\"/bin/sh\", \"{}/{}\"]",
        spec.workdir, START_SCRIPT
    ));

    let mut dockerfile = lines.join("\n");
    dockerfile.push('\n');
    dockerfile
}

/// Inputs for the startup script
#[derive(Debug, Clone)]
pub struct StartScript<'a> {
    pub workdir: &'a str,
    /// Application command, run through `sh -c`
    pub command: &'a str,
    pub internal_port: u16,
    pub exposed_port: u16,
}

impl StartScript<'_> {
    /// socat runs only when the published port differs from the app port
    pub fn needs_forwarder(&self) -> bool {
        self.internal_port != self.exposed_port
    }
}

/// Single quotes for `sh`
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

pub fn render_start_script(script: &StartScript<'_>) -> String {
    let mut out = String::from("#!/bin/sh\n");
    out.push_str(&format!("export PORT={}\n", script.internal_port));
    out.push_str(&format!("cd {}\n\n", script.workdir));

    out.push_str(&format!("sh -c {} &\n", shell_quote(script.command)));
    out.push_str("APP_PID=$!\n");

    let mut children = String::from("$APP_PID $AGENT_PID");
    if script.needs_forwarder() {
        out.push_str(&format!(
            "socat TCP-LISTEN:{},fork,reuseaddr TCP:127.0.0.1:{} &\n",
            script.exposed_port, script.internal_port
        ));
        out.push_str("FWD_PID=$!\n");
        children.push_str(" $FWD_PID");
    }

    out.push_str(&format!(
        "ngrok start --all --config {}/{} --log stdout &\n",
        script.workdir, AGENT_CONFIG
    ));
    out.push_str("AGENT_PID=$!\n\n");

    out.push_str(&format!(
        "trap 'kill -TERM {} 2>/dev/null' TERM INT\n\n",
        children
    ));
    out.push_str("wait $APP_PID\n");
    out.push_str("STATUS=$?\n");
    out.push_str(&format!("kill -TERM {} 2>/dev/null\n", children));
    out.push_str("exit $STATUS\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn script(internal: u16, exposed: u16) -> StartScript<'static> {
        StartScript {
            workdir: "/app",
            command: "node server.js",
            internal_port: internal,
            exposed_port: exposed,
        }
    }

    #[test]
    fn test_dockerfile_for_app() {
        let dockerfile = render_dockerfile(&DockerfileSpec {
            base_image: "node:20-alpine",
            workdir: "/app",
            copy_sources: true,
            install_step: Some("npm install"),
            agent_install: "apk add socat",
            internal_port: 3000,
            exposed_port: 31000,
        });
        assert!(dockerfile.starts_with("FROM node:20-alpine\n"));
        assert!(dockerfile.contains("COPY . /app\nRUN npm install\n"));
        assert!(dockerfile.contains("ENV PORT=3000\nEXPOSE 31000\n"));
        assert!(dockerfile.ends_with("CMD [\"/bin/sh\", \"/app/deployify-start.sh\"]\n"));
    }

    #[test]
    fn test_dockerfile_without_sources() {
        let dockerfile = render_dockerfile(&DockerfileSpec {
            base_image: "postgres:16-alpine",
            workdir: "/deployify",
            copy_sources: false,
            install_step: None,
            agent_install: "true",
            internal_port: 5432,
            exposed_port: 31001,
        });
        assert!(dockerfile.contains("COPY deployify-start.sh tunnel.yml /deployify/\n"));
        assert!(!dockerfile.contains("COPY . "));
    }

    #[test]
    fn test_start_script_with_forwarder() {
        let text = render_start_script(&script(3000, 31000));
        assert!(text.contains("export PORT=3000\n"));
        assert!(text.contains("sh -c 'node server.js' &\n"));
        assert!(text.contains("socat TCP-LISTEN:31000,fork,reuseaddr TCP:127.0.0.1:3000 &\n"));
        assert!(text.contains("trap 'kill -TERM $APP_PID $AGENT_PID $FWD_PID 2>/dev/null' TERM INT"));
        assert!(text.contains("--config /app/tunnel.yml"));
    }

    #[test]
    fn test_start_script_without_forwarder() {
        let text = render_start_script(&script(31000, 31000));
        assert!(!text.contains("socat"));
        assert!(text.contains("trap 'kill -TERM $APP_PID $AGENT_PID 2>/dev/null' TERM INT"));
    }

    #[test]
    fn test_command_is_quoted() {
        let mut s = script(3000, 3000);
        s.command = "echo 'hi' && node app.js";
        let text = render_start_script(&s);
        assert!(text.contains("sh -c 'echo '\\''hi'\\'' && node app.js' &\n"));
    }
}
