//! Pairing certificate generation.
//!
//! Builds the three-certificate chain a pair record carries: a self-signed
//! root CA, a host certificate and a device certificate over the device's
//! RSA public key, both signed by the root. Devices expect SHA-1 RSA
//! signatures and a ten-year validity on all three.

use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::x509::extension::{BasicConstraints, KeyUsage};
use openssl::x509::{X509, X509Builder, X509Extension, X509Name};

use crate::Error;

const VALIDITY_DAYS: u32 = 365 * 10;

/// The generated pairing identity.
#[derive(Debug, Clone)]
pub struct PairCertificates {
    pub root_certificate: X509,
    pub root_private_key: PKey<Private>,
    pub host_certificate: X509,
    pub host_private_key: PKey<Private>,
    pub device_certificate: X509,
}

/// Generates the full certificate chain for a new pairing.
///
/// `device_public_key_pem` is the PKCS#1 RSA public key the device returns
/// for `GetValue("DevicePublicKey")`. Note that this function is
/// computationally heavy in a debug build.
pub fn generate_pair_certificates(device_public_key_pem: &[u8]) -> Result<PairCertificates, Error> {
    let device_rsa = Rsa::public_key_from_pem_pkcs1(device_public_key_pem)
        .or_else(|_| Rsa::public_key_from_pem(device_public_key_pem))?;
    let device_key = PKey::from_rsa(device_rsa)?;

    let root_key = PKey::from_rsa(Rsa::generate(2048)?)?;
    let host_key = PKey::from_rsa(Rsa::generate(2048)?)?;

    // One random 128-bit serial shared by the whole chain. Certain device
    // builds reject the all-zero serial.
    let mut serial = BigNum::new()?;
    serial.rand(128, MsbOption::MAYBE_ZERO, false)?;

    let root_certificate = build_certificate(&serial, &root_key, &root_key, CertKind::Root)?;
    let host_certificate = build_certificate(&serial, &host_key, &root_key, CertKind::Host)?;

    let ski = subject_key_id_hex(&root_key)?;
    let device_certificate =
        build_certificate(&serial, &device_key, &root_key, CertKind::Device { ski })?;

    Ok(PairCertificates {
        root_certificate,
        root_private_key: root_key,
        host_certificate,
        host_private_key: host_key,
        device_certificate,
    })
}

enum CertKind {
    Root,
    Host,
    Device { ski: String },
}

fn build_certificate<T>(
    serial: &BigNum,
    subject_key: &PKey<T>,
    signing_key: &PKey<Private>,
    kind: CertKind,
) -> Result<X509, Error>
where
    T: openssl::pkey::HasPublic,
{
    let mut builder = X509Builder::new()?;
    builder.set_version(2)?;
    let serial = serial.to_asn1_integer()?;
    builder.set_serial_number(&serial)?;
    let not_before = Asn1Time::days_from_now(0)?;
    let not_after = Asn1Time::days_from_now(VALIDITY_DAYS)?;
    builder.set_not_before(&not_before)?;
    builder.set_not_after(&not_after)?;

    // Pair certificates carry empty subject and issuer names.
    let empty_name = X509Name::builder()?.build();
    builder.set_subject_name(&empty_name)?;
    builder.set_issuer_name(&empty_name)?;
    builder.set_pubkey(subject_key)?;

    match kind {
        CertKind::Root => {
            builder.append_extension(BasicConstraints::new().critical().ca().build()?)?;
            builder.append_extension(
                KeyUsage::new().key_cert_sign().digital_signature().build()?,
            )?;
        }
        CertKind::Host => {
            builder.append_extension(BasicConstraints::new().critical().build()?)?;
            builder.append_extension(
                KeyUsage::new().key_encipherment().digital_signature().build()?,
            )?;
        }
        CertKind::Device { ski } => {
            builder.append_extension(BasicConstraints::new().critical().build()?)?;
            builder.append_extension(
                KeyUsage::new().key_encipherment().digital_signature().build()?,
            )?;
            #[allow(deprecated)]
            builder.append_extension(X509Extension::new_nid(
                None,
                None,
                Nid::SUBJECT_KEY_IDENTIFIER,
                &ski,
            )?)?;
        }
    }

    builder.sign(signing_key, MessageDigest::sha1())?;
    Ok(builder.build())
}

/// SHA-1 of the root key's modulus bytes, in the colon-separated hex form
/// the extension parser takes.
fn subject_key_id_hex(root_key: &PKey<Private>) -> Result<String, Error> {
    let modulus = root_key.rsa()?.n().to_vec();
    let digest = openssl::hash::hash(MessageDigest::sha1(), &modulus)?;
    Ok(digest
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":"))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_device_public_key_pem() -> Vec<u8> {
        let rsa = Rsa::generate(2048).unwrap();
        rsa.public_key_to_pem_pkcs1().unwrap()
    }

    #[test]
    fn chain_verifies_against_the_root() {
        let identity = generate_pair_certificates(&sample_device_public_key_pem()).unwrap();

        assert!(identity
            .root_certificate
            .verify(&identity.root_private_key)
            .unwrap());
        assert!(identity
            .host_certificate
            .verify(&identity.root_private_key)
            .unwrap());
        assert!(identity
            .device_certificate
            .verify(&identity.root_private_key)
            .unwrap());
    }

    #[test]
    fn signatures_are_sha1_with_rsa() {
        let identity = generate_pair_certificates(&sample_device_public_key_pem()).unwrap();
        for cert in [
            &identity.root_certificate,
            &identity.host_certificate,
            &identity.device_certificate,
        ] {
            assert_eq!(
                cert.signature_algorithm().object().nid(),
                Nid::SHA1WITHRSAENCRYPTION
            );
        }
    }

    #[test]
    fn validity_spans_ten_years() {
        let identity = generate_pair_certificates(&sample_device_public_key_pem()).unwrap();
        let cert = &identity.host_certificate;
        let diff = cert.not_before().diff(cert.not_after()).unwrap();
        assert_eq!(diff.days, VALIDITY_DAYS as i32);
        assert_eq!(diff.secs, 0);
    }
}
