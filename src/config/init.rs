// ABOUTME: Config scaffolding for new projects.
// ABOUTME: Writes a commented shipwright.yml starter file.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

use super::{CONFIG_FILENAME, Config};

/// Write a starter configuration into `dir` and return its path.
pub fn init_config(dir: &Path, project: Option<&str>, force: bool) -> Result<PathBuf> {
    let config_path = dir.join(CONFIG_FILENAME);

    if config_path.exists() && !force {
        return Err(Error::AlreadyExists(config_path));
    }

    let project = project.unwrap_or("my-app");
    let yaml = generate_template_yaml(project);

    // The starter file must itself be a valid configuration.
    let config = Config::from_yaml(&yaml)?;
    config.validate()?;

    std::fs::write(&config_path, yaml)?;
    Ok(config_path)
}

fn generate_template_yaml(project: &str) -> String {
    format!(
        r#"project: {project}
region: eu-west-1
# zone: eu-west-1a
version: latest

# Uncomment to request a certificate and switch the proxy to TLS.
# domain: {project}.example.org
# admin_email: ops@example.org

host:
  user: deploy
  # address defaults to the provisioner's public_address output
  # key_path: ~/.ssh/id_ed25519
  # SSH host key verification: set to false once known_hosts is populated
  trust_first_connection: true

infra:
  binary: terraform
  working_dir: infra
  variables:
    db_password:
      env: DB_PASSWORD
      default: change-me

workload:
  template: deploy/compose.yml
  remote_path: /srv/{project}/compose.yml
  start_command: docker compose -f /srv/{project}/compose.yml up -d
  stop_command: docker compose -f /srv/{project}/compose.yml down

bootstrap:
  - curl -fsSL https://get.docker.com | sh
  - run: usermod -aG docker deploy
    best_effort: true

migrations:
  commands:
    - docker compose -f /srv/{project}/compose.yml run --rm app migrate

healthchecks:
  - name: web
    http:
      url: "http://${{public_address}}/health"
    interval: 5s
    deadline: 2m

# proxy:
#   template: deploy/nginx-tls.conf
#   remote_path: /etc/nginx/conf.d/{project}.conf
#   test_command: nginx -t
#   reload_command: systemctl reload nginx

verify:
  services: []
  # smoke_url: "http://${{public_address}}/"
  # snapshot_command: /usr/local/bin/backup-db

runner:
  workers: 4
"#,
        project = project
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_valid_starter_config() {
        let dir = tempfile::tempdir().unwrap();
        init_config(dir.path(), Some("shop"), false).unwrap();
        let config = Config::load(&dir.path().join(CONFIG_FILENAME)).unwrap();
        assert_eq!(config.project, "shop");
        assert_eq!(config.bootstrap.len(), 2);
        assert!(config.bootstrap[1].best_effort);
    }

    #[test]
    fn refuses_to_overwrite_without_force() {
        let dir = tempfile::tempdir().unwrap();
        init_config(dir.path(), None, false).unwrap();
        assert!(matches!(
            init_config(dir.path(), None, false),
            Err(Error::AlreadyExists(_))
        ));
        init_config(dir.path(), None, true).unwrap();
    }
}
