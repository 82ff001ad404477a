use base64::{Engine, prelude::BASE64_STANDARD};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::IdeviceError;

/// Encodes a dictionary as an XML plist document
pub(crate) fn plist_to_xml_bytes(p: &plist::Dictionary) -> Result<Vec<u8>, IdeviceError> {
    let mut buf = Vec::new();
    plist::to_writer_xml(&mut buf, p)?;
    Ok(buf)
}

/// Fills `buf` completely
///
/// Returns `false` if the stream ended first. Bytes read before the end are discarded.
pub(crate) async fn read_exact_or_eof<R: AsyncRead + Unpin + ?Sized>(
    reader: &mut R,
    buf: &mut [u8],
) -> std::io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Ok(false);
        }
        filled += n;
    }
    Ok(true)
}

/// Renders a plist value in an indented, human readable form
pub fn pretty_print_plist(p: &plist::Value) -> String {
    print_plist(p, 0)
}

/// Renders a plist dictionary in an indented, human readable form
pub fn pretty_print_dictionary(dict: &plist::Dictionary) -> String {
    print_dictionary(dict, 0)
}

fn print_dictionary(dict: &plist::Dictionary, indentation: usize) -> String {
    let pad = " ".repeat(indentation + 2);
    let items: Vec<String> = dict
        .iter()
        .map(|(k, v)| format!("{pad}{k}: {}", print_plist(v, indentation + 2)))
        .collect();
    format!("{{\n{}\n{}}}", items.join(",\n"), " ".repeat(indentation))
}

fn print_plist(p: &plist::Value, indentation: usize) -> String {
    match p {
        plist::Value::Array(array) => {
            let pad = " ".repeat(indentation + 2);
            let items: Vec<String> = array
                .iter()
                .map(|v| format!("{pad}{}", print_plist(v, indentation + 2)))
                .collect();
            format!("[\n{}\n{}]", items.join(",\n"), " ".repeat(indentation))
        }
        plist::Value::Dictionary(dict) => print_dictionary(dict, indentation),
        plist::Value::Boolean(b) => b.to_string(),
        plist::Value::Data(d) => {
            // Certificates and escrow bags make logs unreadable
            if d.len() > 64 {
                format!("<{} bytes>", d.len())
            } else {
                format!("<{}>", BASE64_STANDARD.encode(d))
            }
        }
        plist::Value::Date(d) => d.to_xml_format(),
        plist::Value::Real(r) => r.to_string(),
        plist::Value::Integer(i) => i.to_string(),
        plist::Value::String(s) => format!("\"{s}\""),
        plist::Value::Uid(u) => format!("uid({})", u.get()),
        _ => "unknown".to_string(),
    }
}
