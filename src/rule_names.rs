//! Rule-name handling shared by the guidance loader and the prioritizer.

/// Tail the rules engine appends to rules deployed through a conformance pack.
const PACK_SUFFIX_MARKER: &str = "-conformance-pack-";

/// Guidance sheets use older names for a few rules.
const RULE_ALIASES: &[(&str, &str)] = &[
    (
        "ec2-instance-managed-by-systems-manager",
        "ec2-instance-managed-by-ssm",
    ),
    ("ec2-instances-in-vpc", "instances-in-vpc"),
    ("restricted-common-ports", "restricted-incoming-traffic"),
    ("restricted-ssh", "incoming-ssh-disabled"),
    ("iam-password-policy", "iam-password-policy-check"),
];

/// Rule family: the rule name without its conformance-pack deployment tail.
pub fn rule_family(rule_name: &str) -> &str {
    let lowered = rule_name.to_ascii_lowercase();
    match lowered.find(PACK_SUFFIX_MARKER) {
        Some(i) => &rule_name[..i],
        None => rule_name,
    }
}

/// Key under which guidance is stored and looked up. Case, `-` and `_` are
/// not significant.
pub fn join_key(rule_name: &str) -> String {
    let family = rule_family(rule_name.trim()).to_ascii_lowercase();
    let canonical = RULE_ALIASES
        .iter()
        .find(|(alias, _)| *alias == family)
        .map(|(_, name)| *name)
        .unwrap_or(family.as_str());

    canonical
        .chars()
        .filter(|c| *c != '-' && *c != '_')
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn family_strips_deployment_suffix() {
        assert_eq!(
            rule_family("s3-public-read-prohibited-conformance-pack-x1y2z3"),
            "s3-public-read-prohibited"
        );
        assert_eq!(
            rule_family("S3-Public-Read-Prohibited-Conformance-Pack-X1"),
            "S3-Public-Read-Prohibited"
        );
        assert_eq!(rule_family("s3-public-read-prohibited"), "s3-public-read-prohibited");
    }

    #[test]
    fn join_key_ignores_case_and_separators() {
        assert_eq!(join_key("s3-public-read-prohibited"), "S3PUBLICREADPROHIBITED");
        assert_eq!(join_key("S3_PUBLIC_READ_PROHIBITED"), "S3PUBLICREADPROHIBITED");
        assert_eq!(
            join_key("s3-public-read-prohibited-conformance-pack-abc"),
            "S3PUBLICREADPROHIBITED"
        );
    }

    #[test]
    fn aliases_resolve_to_engine_names() {
        assert_eq!(join_key("restricted-ssh"), join_key("incoming-ssh-disabled"));
        assert_eq!(
            join_key("ec2-instance-managed-by-systems-manager"),
            "EC2INSTANCEMANAGEDBYSSM"
        );
    }
}
