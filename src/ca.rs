use std::{
    collections::HashMap,
    env, fs,
    io::Write as _,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use anyhow::{Context, bail};
use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
    KeyUsagePurpose,
};
use x509_parser::{parse_x509_certificate, pem::parse_x509_pem};

pub const DEFAULT_CA_SUBDIR: &str = ".pagespeed-quest/ca";
pub const CA_DIR_ENV: &str = "SSL_CA_DIR";
pub const CA_CERT_FILE_NAME: &str = "cert.pem";
pub const CA_KEY_FILE_NAME: &str = "key.pem";

const ROOT_CA_COMMON_NAME: &str = "pagespeed-quest Interception CA";
const DIR_MODE_RESTRICTED: u32 = 0o700;
const FILE_MODE_RESTRICTED: u32 = 0o600;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaMaterialPaths {
    pub ca_dir: PathBuf,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

impl CaMaterialPaths {
    pub fn in_dir(ca_dir: &Path) -> Self {
        Self {
            ca_dir: ca_dir.to_path_buf(),
            cert_path: ca_dir.join(CA_CERT_FILE_NAME),
            key_path: ca_dir.join(CA_KEY_FILE_NAME),
        }
    }
}

/// Certificate and key presented to a client for one intercepted host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafCertMaterial {
    pub hostname: String,
    pub cert_pem: String,
    pub cert_der: Vec<u8>,
    pub key_der: Vec<u8>,
}

/// Issues per-host leaf certificates signed by the interception CA, caching
/// them for the lifetime of the proxy session.
#[derive(Debug)]
pub struct LeafCertGenerator {
    issuer: Issuer<'static, KeyPair>,
    cache: Mutex<HashMap<String, Arc<LeafCertMaterial>>>,
}

impl LeafCertGenerator {
    pub fn from_ca_dir(ca_dir: &Path) -> anyhow::Result<Self> {
        let paths = CaMaterialPaths::in_dir(ca_dir);
        validate_ca_material(&paths.cert_path, &paths.key_path)?;

        let ca_cert_pem = fs::read_to_string(&paths.cert_path)
            .with_context(|| format!("read CA certificate {}", paths.cert_path.display()))?;
        let ca_key_pem = fs::read_to_string(&paths.key_path)
            .with_context(|| format!("read CA private key {}", paths.key_path.display()))?;
        Self::from_ca_pem(&ca_cert_pem, &ca_key_pem)
    }

    pub fn from_ca_pem(ca_cert_pem: &str, ca_key_pem: &str) -> anyhow::Result<Self> {
        let key_pair =
            KeyPair::from_pem(ca_key_pem).context("parse CA private key for leaf issuance")?;
        let issuer = Issuer::from_ca_cert_pem(ca_cert_pem, key_pair)
            .context("parse CA certificate for leaf issuance")?;
        Ok(Self {
            issuer,
            cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn issue_for_host(&self, hostname: &str) -> anyhow::Result<Arc<LeafCertMaterial>> {
        let hostname = normalize_leaf_hostname(hostname)?;

        let mut cache = self
            .cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(existing) = cache.get(&hostname) {
            return Ok(Arc::clone(existing));
        }

        let mut params = CertificateParams::new(vec![hostname.clone()])
            .with_context(|| format!("initialize leaf certificate parameters for `{hostname}`"))?;
        params
            .distinguished_name
            .push(DnType::CommonName, hostname.clone());
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.is_ca = IsCa::NoCa;
        params.use_authority_key_identifier_extension = true;

        let leaf_key =
            KeyPair::generate().with_context(|| format!("generate leaf key for `{hostname}`"))?;
        let cert = params
            .signed_by(&leaf_key, &self.issuer)
            .with_context(|| format!("sign leaf certificate for `{hostname}`"))?;

        let material = Arc::new(LeafCertMaterial {
            hostname: hostname.clone(),
            cert_pem: cert.pem(),
            cert_der: cert.der().to_vec(),
            key_der: leaf_key.serialize_der(),
        });
        cache.insert(hostname, Arc::clone(&material));
        Ok(material)
    }
}

fn normalize_leaf_hostname(hostname: &str) -> anyhow::Result<String> {
    let hostname = hostname.trim();
    let hostname = hostname
        .strip_prefix('[')
        .and_then(|inner| inner.strip_suffix(']'))
        .unwrap_or(hostname);
    let hostname = match hostname.strip_suffix('.') {
        Some(stripped) if !stripped.is_empty() => stripped,
        _ => hostname,
    };
    if hostname.is_empty() {
        bail!("leaf certificate hostname must not be empty");
    }
    Ok(hostname.to_ascii_lowercase())
}

/// Explicit directory, else `SSL_CA_DIR`, else `$HOME/.pagespeed-quest/ca`.
pub fn resolve_ca_dir(ca_dir_override: Option<&Path>) -> anyhow::Result<PathBuf> {
    if let Some(path) = ca_dir_override {
        return Ok(path.to_path_buf());
    }
    if let Some(dir) = env::var_os(CA_DIR_ENV).filter(|dir| !dir.is_empty()) {
        return Ok(PathBuf::from(dir));
    }
    let Some(home) = env::var_os("HOME") else {
        bail!("cannot resolve CA directory: neither {CA_DIR_ENV} nor HOME is set");
    };
    Ok(Path::new(&home).join(DEFAULT_CA_SUBDIR))
}

/// Creates the CA directory and generates CA material unless a valid pair is
/// already there.
pub fn ensure_ca(ca_dir: &Path) -> anyhow::Result<CaMaterialPaths> {
    let paths = CaMaterialPaths::in_dir(ca_dir);
    match (paths.cert_path.exists(), paths.key_path.exists()) {
        (true, true) => {
            validate_ca_material(&paths.cert_path, &paths.key_path)?;
            Ok(paths)
        }
        (false, false) => {
            let paths = generate_ca(ca_dir)?;
            tracing::info!(ca_dir = %ca_dir.display(), "generated interception CA");
            Ok(paths)
        }
        (true, false) => bail!(
            "CA private key {} is missing next to {}",
            paths.key_path.display(),
            paths.cert_path.display()
        ),
        (false, true) => bail!(
            "CA certificate {} is missing next to {}",
            paths.cert_path.display(),
            paths.key_path.display()
        ),
    }
}

pub fn generate_ca(ca_dir: &Path) -> anyhow::Result<CaMaterialPaths> {
    let paths = CaMaterialPaths::in_dir(ca_dir);

    fs::create_dir_all(ca_dir)
        .with_context(|| format!("create CA directory {}", ca_dir.display()))?;
    set_dir_permissions(ca_dir, DIR_MODE_RESTRICTED)?;

    let mut params =
        CertificateParams::new(Vec::new()).context("initialize root CA certificate parameters")?;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params
        .distinguished_name
        .push(DnType::CommonName, ROOT_CA_COMMON_NAME);
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
    ];

    let key_pair = KeyPair::generate().context("generate root CA private key")?;
    let cert = params
        .self_signed(&key_pair)
        .context("self-sign root CA certificate")?;

    write_restricted_file(&paths.cert_path, cert.pem().as_bytes())?;
    write_restricted_file(&paths.key_path, key_pair.serialize_pem().as_bytes())?;
    Ok(paths)
}

pub fn validate_ca_material(cert_path: &Path, key_path: &Path) -> anyhow::Result<()> {
    let cert_pem = fs::read(cert_path)
        .with_context(|| format!("read CA certificate {}", cert_path.display()))?;
    let key_pem = fs::read_to_string(key_path)
        .with_context(|| format!("read CA private key {}", key_path.display()))?;

    let key_pair = KeyPair::from_pem(&key_pem)
        .with_context(|| format!("parse CA private key PEM {}", key_path.display()))?;

    let (_, pem_block) = parse_x509_pem(&cert_pem).map_err(|err| {
        anyhow::anyhow!("parse CA certificate PEM {}: {err}", cert_path.display())
    })?;
    if pem_block.label != "CERTIFICATE" {
        bail!(
            "parse CA certificate PEM {}: expected CERTIFICATE block, got {}",
            cert_path.display(),
            pem_block.label
        );
    }
    let (_, certificate) = parse_x509_certificate(&pem_block.contents).map_err(|err| {
        anyhow::anyhow!(
            "parse CA certificate DER payload {}: {err}",
            cert_path.display()
        )
    })?;

    let cert_public_key = certificate
        .tbs_certificate
        .subject_pki
        .subject_public_key
        .data
        .as_ref();
    if cert_public_key != key_pair.public_key_raw() {
        bail!(
            "CA certificate {} and private key {} do not match",
            cert_path.display(),
            key_path.display()
        );
    }
    Ok(())
}

fn write_restricted_file(path: &Path, contents: &[u8]) -> anyhow::Result<()> {
    let mut file = create_file_with_mode(path, FILE_MODE_RESTRICTED)?;
    file.write_all(contents)
        .with_context(|| format!("write file {}", path.display()))?;
    file.sync_all()
        .with_context(|| format!("sync file {}", path.display()))
}

fn create_file_with_mode(path: &Path, mode: u32) -> anyhow::Result<fs::File> {
    let mut opts = fs::OpenOptions::new();
    opts.create(true).truncate(true).write(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;
    opts.open(path)
        .with_context(|| format!("create file {}", path.display()))
}

fn set_dir_permissions(path: &Path, mode: u32) -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        fs::set_permissions(path, fs::Permissions::from_mode(mode))
            .with_context(|| format!("set permissions on {}", path.display()))?;
    }
    #[cfg(not(unix))]
    let _ = (path, mode);
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{fs, path::Path, sync::Arc};

    use tempfile::tempdir;
    use x509_parser::extensions::GeneralName;

    use super::{
        CaMaterialPaths, LeafCertGenerator, ensure_ca, generate_ca, resolve_ca_dir,
        validate_ca_material,
    };

    #[test]
    fn explicit_ca_dir_wins() {
        let dir = Path::new("/tmp/explicit-ca");
        assert_eq!(resolve_ca_dir(Some(dir)).unwrap(), dir);
    }

    #[test]
    fn ensure_ca_generates_once_and_then_reuses() {
        let temp_dir = tempdir().expect("tempdir should be created");
        let ca_dir = temp_dir.path().join("nested").join("ca");

        let first = ensure_ca(&ca_dir).expect("CA should be generated");
        let cert_pem = fs::read_to_string(&first.cert_path).expect("cert readable");
        assert!(cert_pem.contains("BEGIN CERTIFICATE"));
        let key_pem = fs::read_to_string(&first.key_path).expect("key readable");
        assert!(key_pem.contains("BEGIN PRIVATE KEY"));

        let second = ensure_ca(&ca_dir).expect("existing CA should be reused");
        assert_eq!(first, second);
        assert_eq!(
            fs::read_to_string(&second.cert_path).unwrap(),
            cert_pem,
            "existing material is not rotated"
        );
    }

    #[test]
    fn ensure_ca_rejects_half_present_material() {
        let temp_dir = tempdir().expect("tempdir should be created");
        let ca_dir = temp_dir.path().join("ca");
        let paths = generate_ca(&ca_dir).expect("CA generation should succeed");
        fs::remove_file(&paths.key_path).unwrap();

        let err = ensure_ca(&ca_dir).expect_err("missing key should fail");
        assert!(err.to_string().contains("is missing"), "unexpected error: {err}");
    }

    #[test]
    fn validate_ca_material_rejects_mismatched_cert_and_key() {
        let temp_dir = tempdir().expect("tempdir should be created");
        let first = generate_ca(&temp_dir.path().join("first")).unwrap();
        let second = generate_ca(&temp_dir.path().join("second")).unwrap();

        validate_ca_material(&first.cert_path, &first.key_path)
            .expect("matching pair should validate");
        let err = validate_ca_material(&first.cert_path, &second.key_path)
            .expect_err("mismatched CA certificate/key should fail");
        assert!(err.to_string().contains("do not match"), "unexpected error: {err}");
    }

    #[test]
    fn leaf_certificate_names_the_intercepted_host() {
        let temp_dir = tempdir().expect("tempdir should be created");
        let paths = ensure_ca(&temp_dir.path().join("ca")).unwrap();
        let generator = LeafCertGenerator::from_ca_dir(&paths.ca_dir).unwrap();

        let leaf = generator.issue_for_host("Www.Example.Test.").unwrap();
        assert_eq!(leaf.hostname, "www.example.test");
        assert!(!leaf.key_der.is_empty());

        let (_, certificate) = x509_parser::parse_x509_certificate(&leaf.cert_der)
            .expect("leaf DER should parse");
        let san = certificate
            .subject_alternative_name()
            .expect("SAN lookup should succeed")
            .expect("SAN extension should exist");
        assert!(san.value.general_names.iter().any(|name| matches!(
            name,
            GeneralName::DNSName(value) if *value == "www.example.test"
        )));
    }

    #[test]
    fn leaf_certificates_are_cached_per_host() {
        let temp_dir = tempdir().expect("tempdir should be created");
        let paths = ensure_ca(&temp_dir.path().join("ca")).unwrap();
        let generator = LeafCertGenerator::from_ca_dir(&paths.ca_dir).unwrap();

        let first = generator.issue_for_host("CDN.EXAMPLE.TEST").unwrap();
        let second = generator.issue_for_host("cdn.example.test").unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let err = generator.issue_for_host("  ").expect_err("empty host should fail");
        assert!(err.to_string().contains("must not be empty"));
    }

    #[cfg(unix)]
    #[test]
    fn generated_ca_uses_restricted_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = tempdir().expect("tempdir should be created");
        let ca_dir = temp_dir.path().join("ca");
        let CaMaterialPaths {
            cert_path,
            key_path,
            ..
        } = generate_ca(&ca_dir).unwrap();

        let mode = |path: &Path| fs::metadata(path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode(&ca_dir), 0o700);
        assert_eq!(mode(&cert_path), 0o600);
        assert_eq!(mode(&key_path), 0o600);
    }
}
