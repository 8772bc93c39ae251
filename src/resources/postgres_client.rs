//! PostgreSQL sessions for in-database object sync
//!
//! Controllers open a [`DatabaseSession`] through [`DatabaseAccess`] for
//! the duration of one sync step and call [`DatabaseSession::close`] on
//! every exit path.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use rustls::pki_types::{CertificateDer, ServerName};
use thiserror::Error;
use tokio_postgres_rustls_improved::MakeRustlsConnect;
use tracing::{debug, trace};

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("connection to {0} failed: {1}")]
    Connection(String, String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),
}

impl From<tokio_postgres::Error> for DatabaseError {
    fn from(e: tokio_postgres::Error) -> Self {
        DatabaseError::Query(e.to_string())
    }
}

pub type DatabaseResult<T> = std::result::Result<T, DatabaseError>;

/// Where and as whom to connect
#[derive(Clone, Debug)]
pub struct ConnectionTarget {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
}

/// A role as stored in `pg_roles`
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DbRole {
    pub name: String,
    /// Upper-case role options, e.g. `LOGIN`, `CREATEDB`
    pub flags: BTreeSet<String>,
    pub member_of: BTreeSet<String>,
}

/// One open connection to one database
#[async_trait]
pub trait DatabaseSession: Send {
    async fn list_roles(&mut self) -> DatabaseResult<BTreeMap<String, DbRole>>;

    async fn create_role(&mut self, role: &DbRole, password: Option<&str>) -> DatabaseResult<()>;

    /// Bring options and memberships of an existing role in line
    async fn alter_role(&mut self, role: &DbRole, password: Option<&str>) -> DatabaseResult<()>;

    async fn drop_role(&mut self, name: &str) -> DatabaseResult<()>;

    /// Database name mapped to its owner
    async fn list_databases(&mut self) -> DatabaseResult<BTreeMap<String, String>>;

    async fn create_database(&mut self, name: &str, owner: &str) -> DatabaseResult<()>;

    async fn set_database_owner(&mut self, name: &str, owner: &str) -> DatabaseResult<()>;

    async fn list_schemas(&mut self) -> DatabaseResult<BTreeSet<String>>;

    async fn create_schema(&mut self, name: &str, owner: &str) -> DatabaseResult<()>;

    /// Extension name mapped to its schema
    async fn list_extensions(&mut self) -> DatabaseResult<BTreeMap<String, String>>;

    async fn create_extension(&mut self, name: &str, schema: &str) -> DatabaseResult<()>;

    async fn set_extension_schema(&mut self, name: &str, schema: &str) -> DatabaseResult<()>;

    /// Release the connection
    async fn close(self: Box<Self>);
}

/// Opens database sessions
#[async_trait]
pub trait DatabaseAccess: Send + Sync {
    async fn open(&self, target: &ConnectionTarget) -> DatabaseResult<Box<dyn DatabaseSession>>;
}

/// [`DatabaseAccess`] over tokio-postgres with TLS
///
/// Spilo serves a self-signed certificate, so the server certificate is not
/// verified.
#[derive(Clone, Debug, Default)]
pub struct PostgresAccess;

#[async_trait]
impl DatabaseAccess for PostgresAccess {
    async fn open(&self, target: &ConnectionTarget) -> DatabaseResult<Box<dyn DatabaseSession>> {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&target.host)
            .port(target.port)
            .dbname(&target.database)
            .user(&target.user)
            .password(&target.password)
            .connect_timeout(std::time::Duration::from_secs(10))
            .ssl_mode(tokio_postgres::config::SslMode::Require);

        let tls = MakeRustlsConnect::new(
            rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerifier))
                .with_no_client_auth(),
        );
        let (client, connection) = config
            .connect(tls)
            .await
            .map_err(|e| DatabaseError::Connection(target.host.clone(), e.to_string()))?;
        let task = tokio::spawn(async move {
            if let Err(e) = connection.await {
                trace!(error = %e, "PostgreSQL connection closed");
            }
        });

        debug!(host = %target.host, database = %target.database, "PostgreSQL session opened");
        Ok(Box::new(PostgresSession { client, task }))
    }
}

struct PostgresSession {
    client: tokio_postgres::Client,
    task: tokio::task::JoinHandle<()>,
}

/// Quote an identifier for use in DDL
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a string literal for use in DDL
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Role options that may appear in a `CREATE ROLE` / `ALTER ROLE`
const ROLE_OPTIONS: &[&str] = &[
    "SUPERUSER",
    "NOSUPERUSER",
    "CREATEDB",
    "NOCREATEDB",
    "CREATEROLE",
    "NOCREATEROLE",
    "INHERIT",
    "NOINHERIT",
    "LOGIN",
    "NOLOGIN",
    "REPLICATION",
    "NOREPLICATION",
    "BYPASSRLS",
    "NOBYPASSRLS",
];

fn role_options(role: &DbRole, password: Option<&str>) -> DatabaseResult<String> {
    let mut options = Vec::new();
    for flag in &role.flags {
        if !ROLE_OPTIONS.contains(&flag.as_str()) {
            return Err(DatabaseError::InvalidIdentifier(format!(
                "role option {flag} for {}",
                role.name
            )));
        }
        options.push(flag.clone());
    }
    if let Some(password) = password {
        options.push(format!("PASSWORD {}", quote_literal(password)));
    }
    Ok(options.join(" "))
}

#[async_trait]
impl DatabaseSession for PostgresSession {
    async fn list_roles(&mut self) -> DatabaseResult<BTreeMap<String, DbRole>> {
        let rows = self
            .client
            .query(
                "SELECT r.rolname, r.rolsuper, r.rolcreatedb, r.rolcreaterole, r.rolinherit, \
                 r.rolcanlogin, r.rolreplication, r.rolbypassrls, \
                 ARRAY(SELECT b.rolname FROM pg_auth_members m \
                       JOIN pg_roles b ON m.roleid = b.oid WHERE m.member = r.oid) \
                 FROM pg_roles r WHERE r.rolname !~ '^pg_'",
                &[],
            )
            .await?;

        let mut roles = BTreeMap::new();
        for row in rows {
            let name: String = row.get(0);
            let mut flags = BTreeSet::new();
            for (idx, flag) in [
                (1, "SUPERUSER"),
                (2, "CREATEDB"),
                (3, "CREATEROLE"),
                (4, "INHERIT"),
                (5, "LOGIN"),
                (6, "REPLICATION"),
                (7, "BYPASSRLS"),
            ] {
                let enabled: bool = row.get(idx);
                flags.insert(if enabled { flag.to_string() } else { format!("NO{flag}") });
            }
            let member_of: Vec<String> = row.get(8);
            roles.insert(
                name.clone(),
                DbRole {
                    name,
                    flags,
                    member_of: member_of.into_iter().collect(),
                },
            );
        }
        Ok(roles)
    }

    async fn create_role(&mut self, role: &DbRole, password: Option<&str>) -> DatabaseResult<()> {
        let mut sql = format!(
            "CREATE ROLE {} {}",
            quote_identifier(&role.name),
            role_options(role, password)?
        );
        if !role.member_of.is_empty() {
            let groups: Vec<String> = role.member_of.iter().map(|g| quote_identifier(g)).collect();
            sql.push_str(&format!(" IN ROLE {}", groups.join(", ")));
        }
        self.client.batch_execute(&sql).await?;
        Ok(())
    }

    async fn alter_role(&mut self, role: &DbRole, password: Option<&str>) -> DatabaseResult<()> {
        let options = role_options(role, password)?;
        let mut sql = String::new();
        if !options.is_empty() {
            sql.push_str(&format!(
                "ALTER ROLE {} {};",
                quote_identifier(&role.name),
                options
            ));
        }
        for group in &role.member_of {
            sql.push_str(&format!(
                "GRANT {} TO {};",
                quote_identifier(group),
                quote_identifier(&role.name)
            ));
        }
        if !sql.is_empty() {
            self.client.batch_execute(&sql).await?;
        }
        Ok(())
    }

    async fn drop_role(&mut self, name: &str) -> DatabaseResult<()> {
        let role = quote_identifier(name);
        self.client
            .batch_execute(&format!(
                "REASSIGN OWNED BY {role} TO CURRENT_USER; DROP OWNED BY {role}; DROP ROLE IF EXISTS {role};"
            ))
            .await?;
        Ok(())
    }

    async fn list_databases(&mut self) -> DatabaseResult<BTreeMap<String, String>> {
        let rows = self
            .client
            .query(
                "SELECT d.datname, pg_get_userbyid(d.datdba) FROM pg_database d \
                 WHERE d.datistemplate = false",
                &[],
            )
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get::<_, String>(0), row.get::<_, String>(1)))
            .collect())
    }

    async fn create_database(&mut self, name: &str, owner: &str) -> DatabaseResult<()> {
        self.client
            .batch_execute(&format!(
                "CREATE DATABASE {} OWNER {}",
                quote_identifier(name),
                quote_identifier(owner)
            ))
            .await?;
        Ok(())
    }

    async fn set_database_owner(&mut self, name: &str, owner: &str) -> DatabaseResult<()> {
        self.client
            .batch_execute(&format!(
                "ALTER DATABASE {} OWNER TO {}",
                quote_identifier(name),
                quote_identifier(owner)
            ))
            .await?;
        Ok(())
    }

    async fn list_schemas(&mut self) -> DatabaseResult<BTreeSet<String>> {
        let rows = self
            .client
            .query(
                "SELECT nspname FROM pg_namespace \
                 WHERE nspname !~ '^pg_' AND nspname <> 'information_schema'",
                &[],
            )
            .await?;
        Ok(rows.into_iter().map(|row| row.get::<_, String>(0)).collect())
    }

    async fn create_schema(&mut self, name: &str, owner: &str) -> DatabaseResult<()> {
        self.client
            .batch_execute(&format!(
                "CREATE SCHEMA IF NOT EXISTS {} AUTHORIZATION {}",
                quote_identifier(name),
                quote_identifier(owner)
            ))
            .await?;
        Ok(())
    }

    async fn list_extensions(&mut self) -> DatabaseResult<BTreeMap<String, String>> {
        let rows = self
            .client
            .query(
                "SELECT e.extname, n.nspname FROM pg_extension e \
                 JOIN pg_namespace n ON e.extnamespace = n.oid",
                &[],
            )
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get::<_, String>(0), row.get::<_, String>(1)))
            .collect())
    }

    async fn create_extension(&mut self, name: &str, schema: &str) -> DatabaseResult<()> {
        self.client
            .batch_execute(&format!(
                "CREATE EXTENSION IF NOT EXISTS {} SCHEMA {}",
                quote_identifier(name),
                quote_identifier(schema)
            ))
            .await?;
        Ok(())
    }

    async fn set_extension_schema(&mut self, name: &str, schema: &str) -> DatabaseResult<()> {
        self.client
            .batch_execute(&format!(
                "ALTER EXTENSION {} SET SCHEMA {}",
                quote_identifier(name),
                quote_identifier(schema)
            ))
            .await?;
        Ok(())
    }

    async fn close(self: Box<Self>) {
        let PostgresSession { client, task } = *self;
        drop(client);
        if let Err(e) = task.await {
            trace!(error = %e, "PostgreSQL connection task ended abnormally");
        }
    }
}

/// Accepts any server certificate
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}
