use std::{io::Write, path::Path, sync::Arc};

use thiserror::Error;
use tracing::{debug, info};

use crate::{
    cli::Command,
    config::{ConfigError, MoleConfig, MolePaths},
    definition::{DefinitionError, TunnelDefinition, codec},
    remote::{
        RemoteError,
        https::{HttpsRemote, Registration},
    },
    sync::{
        PullReport, SyncEngine, SyncError, SyncOptions,
        cache::{LocalCache, tunnel_name},
    },
};

#[derive(Error, Debug)]
pub enum MoleError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Definition(#[from] DefinitionError),
    #[error("io error on {1}: {0}")]
    Io(std::io::Error, String),
}
impl MoleError {
    fn io(err: std::io::Error, path: &Path) -> Self {
        MoleError::Io(err, path.display().to_string())
    }
}

/// Paths and configuration every command runs against.
pub(crate) struct Context {
    pub paths: MolePaths,
    pub config: MoleConfig,
}

impl Context {
    pub fn load(paths: MolePaths) -> Result<Self, MoleError> {
        paths.ensure()?;
        let config = MoleConfig::load_or_init(&paths)?;
        Ok(Context { paths, config })
    }
    fn remote(&self) -> Result<HttpsRemote, MoleError> {
        Ok(HttpsRemote::new(
            &self.config.server,
            &self.paths,
            self.config.request_timeout(),
        )?)
    }
    fn cache(&self) -> LocalCache {
        LocalCache::new(&self.paths.tunnels_dir, self.config.decode_options())
    }
    fn engine(&self) -> Result<SyncEngine, MoleError> {
        Ok(SyncEngine::new(
            Arc::new(self.remote()?),
            self.cache(),
            SyncOptions {
                fetch_concurrency: self.config.sync.fetch_concurrency,
                request_timeout: self.config.request_timeout(),
            },
        ))
    }
}

pub(crate) async fn run(command: Command, mut context: Context) -> Result<(), MoleError> {
    match command {
        Command::List { remote: false } => {
            let cache = context.cache();
            debug!("listing files in {}", cache.dir().display());
            let tunnels = cache.list().await?;
            print!("{}", render_table(&tunnels));
        }
        Command::List { remote: true } => {
            for entry in context.engine()?.list_remote().await? {
                println!("{}", tunnel_name(&entry.name));
            }
        }
        Command::Pull => pull(&context).await?,
        Command::Push { file } => {
            let report = context.engine()?.push(&file).await?;
            println!("sent {} bytes", report.bytes);
        }
        Command::Register {
            server,
            token,
            port,
        } => {
            info!("requesting registration from server {server}");
            context.config.server.host = server;
            if let Some(port) = port {
                context.config.server.port = port;
            }
            let registration = context.remote()?.register(&token).await?;
            debug!("received certificate and key from server");
            write_identity(&context.paths, &registration)?;
            context.config.save(&context.paths)?;
            println!("registered");
            pull(&context).await?;
        }
        Command::GetToken => {
            println!("a token can be used only once, and only the most recently generated token is valid");
            println!("{}", context.remote()?.new_token().await?);
        }
        Command::NewUser { username } => {
            debug!("requesting user {username}");
            println!("{}", context.remote()?.new_user(&username).await?);
        }
        Command::Rm { tunnel } => {
            let name = if tunnel.ends_with(".ini") {
                tunnel
            } else {
                format!("{tunnel}.ini")
            };
            context.remote()?.delete(&name).await?;
            println!("deleted {}", tunnel_name(&name));
        }
        Command::View { tunnel } => {
            let definition = context.cache().load(&tunnel).await?;
            print!("{}", codec::encode(&definition));
        }
        Command::Export { tunnel, outfile } => {
            let definition = context.cache().load(&tunnel).await?;
            tokio::fs::write(&outfile, codec::encode(&definition))
                .await
                .map_err(|e| MoleError::io(e, &outfile))?;
            println!("{}", outfile.display());
        }
    }
    Ok(())
}

async fn pull(context: &Context) -> Result<(), MoleError> {
    let report = context.engine()?.pull().await?;
    debug!("{} tunnel definitions already up to date", report.skipped);
    print!("{}", render_pull(&report));
    Ok(())
}

fn render_pull(report: &PullReport) -> String {
    let mut out = String::new();
    for entry in &report.pulled {
        out.push_str(&format!(
            "pulled {} ({})\n",
            tunnel_name(&entry.name),
            entry.kind
        ));
    }
    out.push_str(&format!("{} tunnel definitions in sync\n", report.total));
    out
}

fn render_table(tunnels: &[(String, Result<TunnelDefinition, DefinitionError>)]) -> String {
    let mut rows = vec![(
        String::from("TUNNEL"),
        String::from("DESCRIPTION"),
        String::from("HOSTS"),
    )];
    for (file, loaded) in tunnels {
        match loaded {
            Ok(definition) => {
                let hosts: Vec<&str> = definition.hosts().keys().map(String::as_str).collect();
                rows.push((
                    definition.name().to_string(),
                    definition.description().to_string(),
                    hosts.join(", "),
                ));
            }
            Err(e) => rows.push((tunnel_name(file), e.to_string(), String::from("-"))),
        }
    }
    let name_width = rows.iter().map(|r| r.0.chars().count()).max().unwrap_or(0);
    let description_width = rows.iter().map(|r| r.1.chars().count()).max().unwrap_or(0);
    rows.iter()
        .map(|(name, description, hosts)| {
            format!("{name:<name_width$}  {description:<description_width$}  {hosts}")
                .trim_end()
                .to_string()
                + "\n"
        })
        .collect()
}

/// Stores the client certificate and key, readable by the owner only.
fn write_identity(paths: &MolePaths, registration: &Registration) -> Result<(), MoleError> {
    for (path, content) in [
        (&paths.cert_file, &registration.cert),
        (&paths.key_file, &registration.key),
    ] {
        let mut options = std::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(path).map_err(|e| MoleError::io(e, path))?;
        // mode only applies on creation, a file left by an earlier run keeps its own
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(std::fs::Permissions::from_mode(0o600))
                .map_err(|e| MoleError::io(e, path))?;
        }
        file.write_all(content.as_bytes())
            .map_err(|e| MoleError::io(e, path))?;
    }
    Ok(())
}
