// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Description artefacts for direct network printers.
//
// A queue pointing at an IPP network printer needs either a printer
// description file synthesised from the printer's advertised capabilities,
// or a System V interface script that pipes jobs through the PDL filter.
// Both are written as temp files owned by the catalogue entry; dropping
// the entry deletes the file, so no exit path can leak an artefact.

use std::io::Write;

use ipp::prelude::*;
use tempfile::TempPath;
use tracing::debug;

use spoolwatch_core::error::{Result, SpoolwatchError};

/// Filter binary used by generated interface scripts, relative to the
/// print service's server-bin directory.
const PDL_FILTER: &str = "filter/pdftoippprinter";

/// Default server-bin directory when `CUPS_SERVERBIN` is unset.
const DEFAULT_SERVERBIN: &str = "/usr/lib/cups";

/// Synthesise a printer description from a Get-Printer-Attributes reply.
///
/// Capabilities → description bytes; pure apart from reading the
/// attribute groups.  Returns `None` when the reply does not carry enough
/// to describe the printer (caller falls back to an interface script).
pub fn synthesize_description(attrs: &IppAttributes) -> Option<Vec<u8>> {
    let printer = attrs
        .groups_of(DelimiterTag::PrinterAttributes)
        .next()
        .map(|group| group.attributes())?;

    let make_model = printer
        .get("printer-make-and-model")
        .map(|attr| attr.value().to_string())
        .filter(|value| !value.is_empty())?;

    let formats: Vec<String> = printer
        .get("document-format-supported")
        .map(|attr| match attr.value() {
            IppValue::Array(values) => values.iter().map(|v| v.to_string()).collect(),
            value => vec![value.to_string()],
        })
        .unwrap_or_default();

    // Without a driverless-capable format there is nothing we can describe.
    let format = formats
        .iter()
        .find(|f| {
            f.eq_ignore_ascii_case("application/pdf")
                || f.eq_ignore_ascii_case("application/postscript")
                || f.eq_ignore_ascii_case("image/pwg-raster")
        })?
        .clone();

    let color = printer
        .get("color-supported")
        .map(|attr| matches!(attr.value(), IppValue::Boolean(true)))
        .unwrap_or(false);

    let mut description = Vec::new();
    let _ = writeln!(description, "*PPD-Adobe: \"4.3\"");
    let _ = writeln!(description, "*FormatVersion: \"4.3\"");
    let _ = writeln!(description, "*ModelName: \"{make_model}\"");
    let _ = writeln!(description, "*NickName: \"{make_model}, driverless\"");
    let _ = writeln!(description, "*ShortNickName: \"{make_model}\"");
    let _ = writeln!(description, "*LanguageLevel: \"3\"");
    let _ = writeln!(
        description,
        "*ColorDevice: {}",
        if color { "True" } else { "False" }
    );
    let _ = writeln!(description, "*cupsFilter2: \"{format} {format} 0 -\"");
    let _ = writeln!(description, "*cupsLanguages: \"en\"");
    Some(description)
}

/// Write a synthesised description to a temp file.
pub fn write_description_file(bytes: &[u8]) -> Result<TempPath> {
    let mut file = tempfile::Builder::new()
        .prefix("spoolwatch-")
        .suffix(".ppd")
        .tempfile()?;
    file.write_all(bytes)?;
    file.flush()?;
    let path = file.into_temp_path();
    debug!(path = %path.display(), "wrote printer description file");
    Ok(path)
}

/// Emit an interface script that forwards jobs to the PDL filter with the
/// printer's output format and model.
///
/// `pdl` and `make_model` must already be sanitised; they are spliced into
/// a shell command line.
pub fn write_interface_script(queue_name: &str, pdl: &str, make_model: &str) -> Result<TempPath> {
    let serverbin =
        std::env::var("CUPS_SERVERBIN").unwrap_or_else(|_| DEFAULT_SERVERBIN.to_string());

    let script = format!(
        "#!/bin/sh\n\
         # Interface script for printer {queue_name}\n\
         \n\
         if [ $# -lt 5 -o $# -gt 6 ]; then\n\
         \x20 echo \"ERROR: $0 job-id user title copies options [file]\" >&2\n\
         \x20 exit 1\n\
         fi\n\
         \n\
         # Read from given file\n\
         if [ -n \"$6\" ]; then\n\
         \x20 exec \"$0\" \"$1\" \"$2\" \"$3\" \"$4\" \"$5\" < \"$6\"\n\
         fi\n\
         \n\
         extra_options=\"output-format={pdl} make-and-model={make_model}\"\n\
         \n\
         {serverbin}/{PDL_FILTER} \"$1\" \"$2\" \"$3\" \"$4\" \"$5 $extra_options\"\n"
    );

    let mut file = tempfile::Builder::new()
        .prefix("spoolwatch-")
        .suffix(".sh")
        .tempfile()?;
    file.write_all(script.as_bytes())?;
    file.flush()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o755);
        std::fs::set_permissions(file.path(), perms)
            .map_err(SpoolwatchError::Io)?;
    }

    let path = file.into_temp_path();
    debug!(path = %path.display(), queue = queue_name, "wrote interface script");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(pairs: &[(&str, IppValue)]) -> IppAttributes {
        let mut attrs = IppAttributes::default();
        for (name, value) in pairs {
            attrs.add(
                DelimiterTag::PrinterAttributes,
                IppAttribute::new(name, value.clone()),
            );
        }
        attrs
    }

    #[test]
    fn description_requires_make_and_model() {
        let reply = attrs(&[(
            "document-format-supported",
            IppValue::MimeMediaType("application/pdf".into()),
        )]);
        assert!(synthesize_description(&reply).is_none());
    }

    #[test]
    fn description_requires_driverless_format() {
        let reply = attrs(&[
            (
                "printer-make-and-model",
                IppValue::TextWithoutLanguage("HP LaserJet 4".into()),
            ),
            (
                "document-format-supported",
                IppValue::MimeMediaType("application/octet-stream".into()),
            ),
        ]);
        assert!(synthesize_description(&reply).is_none());
    }

    #[test]
    fn description_includes_model_and_format() {
        let reply = attrs(&[
            (
                "printer-make-and-model",
                IppValue::TextWithoutLanguage("HP LaserJet 4".into()),
            ),
            (
                "document-format-supported",
                IppValue::Array(vec![
                    IppValue::MimeMediaType("application/octet-stream".into()),
                    IppValue::MimeMediaType("application/pdf".into()),
                ]),
            ),
        ]);
        let description = synthesize_description(&reply).unwrap();
        let text = String::from_utf8(description).unwrap();
        assert!(text.contains("HP LaserJet 4"));
        assert!(text.contains("application/pdf"));
    }

    #[test]
    fn interface_script_mentions_pdl_and_model() {
        let path = write_interface_script("laser", "application/pdf", "HP-LaserJet-4").unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("#!/bin/sh"));
        assert!(text.contains("output-format=application/pdf"));
        assert!(text.contains("make-and-model=HP-LaserJet-4"));
        drop(path); // TempPath removes the file
    }

    #[test]
    fn temp_path_deletes_on_drop() {
        let path = write_description_file(b"*PPD-Adobe: \"4.3\"\n").unwrap();
        let on_disk = path.to_path_buf();
        assert!(on_disk.exists());
        drop(path);
        assert!(!on_disk.exists());
    }
}
