// This file is part of qnet-arbiter.

//! Server-wide TLS configuration (part of component C5): builds one `rustls::ServerConfig`
//! at startup from a file-based certificate store, the same `pemfile::certs`/
//! `pkcs8_private_keys` loading `examples/cloudflare-cfnts/src/ke_server/config.rs` uses,
//! adapted from that crate's single fixed cert/key pair to this protocol's
//! `{cert_store_path}/{cert_nickname}.{crt,key}` naming (itself carried over from
//! `qnetd_advanced_settings.h`'s NSS `cert_nickname` field, rebased onto plain PEM files since
//! `rustls` has no NSS database notion).

use crate::config::ClientCertRequirement;
use crate::error::ArbiterError;
use rustls::internal::pemfile;
use rustls::{
    AllowAnyAnonymousOrAuthenticatedClient, AllowAnyAuthenticatedClient, Certificate, ClientCertVerifier, NoClientAuth,
    PrivateKey, RootCertStore, ServerConfig,
};
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

fn load_certs(path: &str) -> Result<Vec<Certificate>, ArbiterError> {
    let file = File::open(path)?;
    pemfile::certs(&mut BufReader::new(file)).map_err(|()| ArbiterError::BadArgument(format!("cannot parse certificate chain from {}", path)))
}

fn load_key(path: &str) -> Result<PrivateKey, ArbiterError> {
    let file = File::open(path)?;
    let mut keys = pemfile::pkcs8_private_keys(&mut BufReader::new(file))
        .map_err(|()| ArbiterError::BadArgument(format!("cannot parse private key from {}", path)))?;
    keys.pop()
        .ok_or_else(|| ArbiterError::BadArgument(format!("no private key found in {}", path)))
}

/// `cert_store_path/ca.crt` is only consulted when client certificates are requested at all;
/// `ClientCertRequirement::Never` never touches the filesystem for it.
fn client_verifier(cert_store_path: &str, requirement: ClientCertRequirement) -> Result<Arc<dyn ClientCertVerifier>, ArbiterError> {
    if requirement == ClientCertRequirement::Never {
        return Ok(NoClientAuth::new());
    }

    let ca_path = format!("{}/ca.crt", cert_store_path);
    let ca_certs = load_certs(&ca_path)?;
    let mut roots = RootCertStore::empty();
    for cert in ca_certs {
        roots
            .add(&cert)
            .map_err(|err| ArbiterError::BadArgument(format!("invalid CA certificate in {}: {:?}", ca_path, err)))?;
    }

    Ok(match requirement {
        ClientCertRequirement::Required => AllowAnyAuthenticatedClient::new(roots),
        _ => AllowAnyAnonymousOrAuthenticatedClient::new(roots),
    })
}

/// Builds the server-wide TLS config once at startup; every accepted client clones the
/// resulting `Arc` instead of re-parsing the cert store per connection.
pub fn build_server_config(
    cert_store_path: &str,
    cert_nickname: &str,
    client_cert_required: ClientCertRequirement,
) -> Result<Arc<ServerConfig>, ArbiterError> {
    let cert_path = format!("{}/{}.crt", cert_store_path, cert_nickname);
    let key_path = format!("{}/{}.key", cert_store_path, cert_nickname);
    let certs = load_certs(&cert_path)?;
    let key = load_key(&key_path)?;

    let verifier = client_verifier(cert_store_path, client_cert_required)?;
    let mut config = ServerConfig::new(verifier);
    config.set_single_cert(certs, key)?;
    Ok(Arc::new(config))
}
