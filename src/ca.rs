//! Pairing record generation
//!
//! Builds the three certificate chain lockdownd expects in a `Pair` request: a self-signed root,
//! a host certificate and a certificate over the device's own public key, both issued by the
//! root. Devices validate these the way they always have, which means SHA-1 signatures, a zero
//! serial number and a fixed extension layout.

use std::{str::FromStr, time::Duration};

use rsa::{
    RsaPrivateKey, RsaPublicKey,
    pkcs1::{DecodeRsaPublicKey, EncodeRsaPrivateKey},
    pkcs1v15::{Signature, SigningKey},
    pkcs8::LineEnding,
};
use rustls::pki_types::CertificateDer;
use sha1::{Digest, Sha1};
use tracing::debug;
use x509_cert::{
    Certificate,
    builder::{Builder, CertificateBuilder, Profile},
    der::{
        Encode, Length, Writer,
        asn1::OctetString,
        oid::{AssociatedOid, ObjectIdentifier},
    },
    ext::{
        AsExtension, Extension,
        pkix::{BasicConstraints, KeyUsage, KeyUsages, SubjectKeyIdentifier},
    },
    name::Name,
    serial_number::SerialNumber,
    spki::SubjectPublicKeyInfoOwned,
    time::Validity,
};

use crate::{IdeviceError, pairing_file::PairingFile};

/// Size of the generated root and host keys
pub const KEY_BITS: usize = 2048;
/// How long the generated certificates are valid for
pub const VALIDITY: Duration = Duration::from_secs(3650 * 24 * 60 * 60);

/// An extension whose criticality is set explicitly instead of derived from its contents
struct Marked<E> {
    extension: E,
    critical: bool,
}

impl<E: AssociatedOid> AssociatedOid for Marked<E> {
    const OID: ObjectIdentifier = E::OID;
}

impl<E: Encode> Encode for Marked<E> {
    fn encoded_len(&self) -> x509_cert::der::Result<Length> {
        self.extension.encoded_len()
    }

    fn encode(&self, writer: &mut impl Writer) -> x509_cert::der::Result<()> {
        self.extension.encode(writer)
    }
}

impl<E: AssociatedOid + Encode> AsExtension for Marked<E> {
    fn critical(&self, _subject: &Name, _extensions: &[Extension]) -> bool {
        self.critical
    }
}

fn subject_key_identifier(
    spki: &SubjectPublicKeyInfoOwned,
) -> Result<SubjectKeyIdentifier, IdeviceError> {
    let digest = Sha1::digest(spki.subject_public_key.raw_bytes());
    Ok(SubjectKeyIdentifier(OctetString::new(digest.to_vec())?))
}

/// Issues one certificate
///
/// CA certificates get basic constraints and a subject key identifier. Leaves additionally get
/// a critical key usage of digital signature and key encipherment.
fn issue(
    issuer: Option<Name>,
    subject: Name,
    public_key: &RsaPublicKey,
    signer: &SigningKey<Sha1>,
    validity: Validity,
    ca: bool,
) -> Result<Certificate, IdeviceError> {
    let spki = SubjectPublicKeyInfoOwned::from_key(public_key.clone())?;
    let ski = subject_key_identifier(&spki)?;

    let mut builder = CertificateBuilder::new(
        Profile::Manual { issuer },
        SerialNumber::new(&[0])?,
        validity,
        subject,
        spki,
        signer,
    )?;
    builder.add_extension(&Marked {
        extension: BasicConstraints {
            ca,
            path_len_constraint: None,
        },
        critical: true,
    })?;
    builder.add_extension(&Marked {
        extension: ski,
        critical: false,
    })?;
    if !ca {
        builder.add_extension(&Marked {
            extension: KeyUsage(KeyUsages::DigitalSignature | KeyUsages::KeyEncipherment),
            critical: true,
        })?;
    }

    Ok(builder.build::<Signature>()?)
}

fn der(cert: &Certificate) -> Result<CertificateDer<'static>, IdeviceError> {
    Ok(CertificateDer::from(cert.to_der()?))
}

fn key_pem(key: &RsaPrivateKey) -> Result<Vec<u8>, IdeviceError> {
    Ok(key.to_pkcs1_pem(LineEnding::LF)?.as_bytes().to_vec())
}

/// Generates a complete pairing record for a device
///
/// Heavy in debug builds: two 2048 bit RSA keys are generated.
///
/// # Arguments
/// * `device_public_key_pem` - The device's `DevicePublicKey` value, a PKCS#1 PEM
/// * `system_buid` - The host's BUID as reported by usbmuxd
/// * `udid` - If given, names the root certificate after the device
///
/// # Errors
/// `InvalidArgument` for an empty key or BUID; a malformed key surfaces the PKCS#1 error
pub fn generate_pairing_file(
    device_public_key_pem: &[u8],
    system_buid: &str,
    udid: Option<&str>,
) -> Result<PairingFile, IdeviceError> {
    validate(device_public_key_pem, system_buid)?;

    let mut rng = rsa::rand_core::OsRng;
    let root_key = RsaPrivateKey::new(&mut rng, KEY_BITS)?;
    let host_key = RsaPrivateKey::new(&mut rng, KEY_BITS)?;
    generate_pairing_file_with_keys(device_public_key_pem, system_buid, udid, root_key, host_key)
}

fn validate(device_public_key_pem: &[u8], system_buid: &str) -> Result<(), IdeviceError> {
    if device_public_key_pem.is_empty() {
        return Err(IdeviceError::InvalidArgument("device public key is empty"));
    }
    if system_buid.is_empty() {
        return Err(IdeviceError::InvalidArgument("system BUID is empty"));
    }
    Ok(())
}

/// [`generate_pairing_file`] with caller supplied root and host keys
pub(crate) fn generate_pairing_file_with_keys(
    device_public_key_pem: &[u8],
    system_buid: &str,
    udid: Option<&str>,
    root_key: RsaPrivateKey,
    host_key: RsaPrivateKey,
) -> Result<PairingFile, IdeviceError> {
    validate(device_public_key_pem, system_buid)?;
    let device_key =
        RsaPublicKey::from_pkcs1_pem(&String::from_utf8(device_public_key_pem.to_vec())?)?;

    let validity = Validity::from_now(VALIDITY)?;
    let root_name = match udid {
        Some(udid) => Name::from_str(&format!("CN=Root Certification Authority,OU={udid}"))?,
        None => Name::default(),
    };
    let root_public = RsaPublicKey::from(&root_key);
    let signer = SigningKey::<Sha1>::new(root_key.clone());

    let root_cert = issue(None, root_name.clone(), &root_public, &signer, validity, true)?;
    let host_cert = issue(
        Some(root_name.clone()),
        Name::default(),
        &RsaPublicKey::from(&host_key),
        &signer,
        validity,
        false,
    )?;
    let device_cert = issue(
        Some(root_name),
        Name::default(),
        &device_key,
        &signer,
        validity,
        false,
    )?;

    let host_id = uuid::Uuid::new_v4().to_string().to_uppercase();
    debug!("Generated pairing record with host ID {host_id}");

    Ok(PairingFile {
        device_certificate: der(&device_cert)?,
        host_private_key: Some(key_pem(&host_key)?),
        host_certificate: der(&host_cert)?,
        root_private_key: Some(key_pem(&root_key)?),
        root_certificate: der(&root_cert)?,
        system_buid: Some(system_buid.to_string()),
        host_id: Some(host_id),
        escrow_bag: None,
        wifi_mac_address: None,
        udid: udid.map(ToString::to_string),
    })
}
