//! G-code header metadata: fields recovered from the leading comment block
//! of a file before the first real command line.

/// The unit a [`MaterialAmount`] was reported in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaterialKind {
    Length,
    Volume,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MaterialAmount {
    pub amount: f64,
    pub kind: MaterialKind,
}

/// Metadata scanned out of a file's leading `;`-prefixed lines.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GcodeHeader {
    pub flavor: Option<String>,
    pub total_time: Option<u64>,
    /// In extruder order: one entry per `;Filament used:` segment or
    /// `;MATERIAL[2]:` line, in the order they appeared.
    pub material_amounts: Vec<MaterialAmount>,
}

/// Classify one header comment line (with the leading `;` already
/// stripped). Unrecognized fields are ignored.
pub fn parse_header_field(rest: &str, header: &mut GcodeHeader) {
    if let Some(value) = rest.strip_prefix("FLAVOR:") {
        header.flavor = Some(value.trim().to_owned());
    } else if let Some(value) = rest.strip_prefix("TIME:") {
        if let Ok(seconds) = value.trim().parse() {
            header.total_time = Some(seconds);
        }
    } else if let Some(value) = rest.strip_prefix("Filament used:") {
        for segment in value.split(',') {
            let segment = segment.trim();
            let Some((amount_str, _unit)) = segment.split_once(' ') else { continue };
            if let Ok(amount) = amount_str.trim().parse() {
                header.material_amounts.push(MaterialAmount { amount, kind: MaterialKind::Length });
            }
        }
    } else if let Some(value) = rest.strip_prefix("MATERIAL2:").or_else(|| rest.strip_prefix("MATERIAL:")) {
        if let Ok(amount) = value.trim().parse::<f64>() {
            header.material_amounts.push(MaterialAmount { amount, kind: MaterialKind::Volume });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_from_lines(lines: &[&str]) -> GcodeHeader {
        let mut header = GcodeHeader::default();
        for line in lines {
            parse_header_field(line.strip_prefix(';').unwrap_or(line), &mut header);
        }
        header
    }

    #[test]
    fn parses_flavor_time_and_filament_used() {
        let header = header_from_lines(&[
            ";FLAVOR:Marlin",
            ";TIME:67",
            ";Filament used: 24.2886 m, 5.10839 m",
        ]);
        assert_eq!(header.flavor.as_deref(), Some("Marlin"));
        assert_eq!(header.total_time, Some(67));
        assert_eq!(
            header.material_amounts,
            vec![
                MaterialAmount { amount: 24.2886, kind: MaterialKind::Length },
                MaterialAmount { amount: 5.10839, kind: MaterialKind::Length },
            ]
        );
    }

    #[test]
    fn parses_material_fields_in_order() {
        let header = header_from_lines(&[";MATERIAL:1200", ";MATERIAL2:340"]);
        assert_eq!(
            header.material_amounts,
            vec![
                MaterialAmount { amount: 1200.0, kind: MaterialKind::Volume },
                MaterialAmount { amount: 340.0, kind: MaterialKind::Volume },
            ]
        );
    }

    #[test]
    fn unrecognized_field_is_ignored() {
        let header = header_from_lines(&[";LAYER_HEIGHT:0.2"]);
        assert_eq!(header, GcodeHeader::default());
    }

    #[test]
    fn volumetric_flavor_is_a_plain_string() {
        let header = header_from_lines(&[";FLAVOR:Marlin(Volumetric)"]);
        assert_eq!(header.flavor.as_deref(), Some("Marlin(Volumetric)"));
    }
}
