//! snake_case conversion for outgoing JSON keys.
//!
//! Lower-cases a PascalCase/camelCase field name, inserting `_` before each
//! internal capital letter. Adjacent capitals are treated as one acronym
//! until a lower-case letter follows, so `AcronymURITest` becomes
//! `acronym_uri_test` rather than `acronym_u_r_i_test`.

/// Convert a single PascalCase/camelCase identifier to snake_case.
pub fn to_snake_case(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len() + 4);

    for (i, &c) in chars.iter().enumerate() {
        if c.is_ascii_uppercase() {
            if i > 0 {
                let prev = chars[i - 1];
                let next = chars.get(i + 1).copied();
                let starts_new_word = prev.is_ascii_lowercase()
                    || (prev.is_ascii_uppercase() && next.is_some_and(|n| n.is_ascii_lowercase()));
                if starts_new_word {
                    out.push('_');
                }
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::to_snake_case;

    #[test]
    fn property_to_snake_case() {
        assert_eq!(to_snake_case("Property"), "property");
    }

    #[test]
    fn pascal_case_to_snake_case() {
        assert_eq!(to_snake_case("PascalCase"), "pascal_case");
    }

    #[test]
    fn lowercase_is_unchanged() {
        assert_eq!(to_snake_case("lowercase"), "lowercase");
    }

    #[test]
    fn camel_case_to_snake_case() {
        assert_eq!(to_snake_case("camelCase"), "camel_case");
    }

    #[test]
    fn acronym_uri_test() {
        assert_eq!(to_snake_case("AcronymURITest"), "acronym_uri_test");
    }

    #[test]
    fn property_with_trailing_single_capital() {
        assert_eq!(to_snake_case("propertyWithP"), "property_with_p");
    }
}
