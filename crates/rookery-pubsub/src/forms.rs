//! XEP-0004 data form helpers.
//!
//! Handles parsing of submitted forms and building of configuration
//! forms, plus expansion of the short-form node configuration (an
//! `access` attribute with optional `group` children) into an
//! equivalent submitted form.

use std::collections::HashMap;

use minidom::Element;

use crate::stanza::NS_DATA_FORMS;

/// FORM_TYPE for node configuration forms.
pub const FORM_TYPE_NODE_CONFIG: &str = "http://jabber.org/protocol/pubsub#node_config";

/// FORM_TYPE for subscription option forms.
pub const FORM_TYPE_SUBSCRIBE_OPTIONS: &str = "http://jabber.org/protocol/pubsub#subscribe_options";

/// FORM_TYPE for subscription authorization forms.
pub const FORM_TYPE_SUBSCRIBE_AUTHORIZATION: &str =
    "http://jabber.org/protocol/pubsub#subscribe_authorization";

/// Parse a boolean value from a data form field.
///
/// XEP-0004 boolean values can be: "1", "true", "0", "false"
pub fn parse_boolean(s: &str) -> bool {
    matches!(s, "1" | "true")
}

/// A submitted data form, indexed by field var.
///
/// Unknown fields are retained so callers can ignore what they do not
/// recognize without losing round-trip information.
#[derive(Debug, Clone, Default)]
pub struct SubmittedForm {
    fields: HashMap<String, Vec<String>>,
}

impl SubmittedForm {
    /// Parse an `x` element in the `jabber:x:data` namespace.
    ///
    /// Accepts submitted forms, blank forms, and untyped forms; rejects
    /// "cancel" and "result" which carry no usable field data.
    pub fn from_element(elem: &Element) -> Option<Self> {
        if elem.name() != "x" || elem.ns() != NS_DATA_FORMS {
            return None;
        }
        match elem.attr("type") {
            Some("submit") | Some("form") | None => {}
            Some(_) => return None,
        }

        let mut fields: HashMap<String, Vec<String>> = HashMap::new();
        for field in elem.children().filter(|c| c.name() == "field") {
            let Some(var) = field.attr("var") else {
                continue;
            };
            let values: Vec<String> = field
                .children()
                .filter(|c| c.name() == "value")
                .map(|v| v.text())
                .collect();
            fields.insert(var.to_string(), values);
        }

        Some(Self { fields })
    }

    /// Locate and parse the first submitted form child of an element.
    pub fn find_in(parent: &Element) -> Option<Self> {
        parent
            .children()
            .find(|c| c.name() == "x" && c.ns() == NS_DATA_FORMS)
            .and_then(Self::from_element)
    }

    /// The form's FORM_TYPE value, if present.
    pub fn form_type(&self) -> Option<&str> {
        self.value("FORM_TYPE")
    }

    /// Whether the form contains the given field at all.
    pub fn has_field(&self, var: &str) -> bool {
        self.fields.contains_key(var)
    }

    /// First value of a field.
    pub fn value(&self, var: &str) -> Option<&str> {
        self.fields
            .get(var)
            .and_then(|vs| vs.first())
            .map(String::as_str)
    }

    /// All values of a field.
    pub fn values(&self, var: &str) -> &[String] {
        self.fields.get(var).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Boolean value of a field.
    pub fn bool_value(&self, var: &str) -> Option<bool> {
        self.value(var).map(parse_boolean)
    }

    /// Insert a field, replacing any previous values.
    pub fn set(&mut self, var: impl Into<String>, values: Vec<String>) {
        self.fields.insert(var.into(), values);
    }
}

/// Start a data form element of the given type ("form", "submit", "result").
pub fn form_element(form_type: &str) -> Element {
    Element::builder("x", NS_DATA_FORMS)
        .attr("type", form_type)
        .build()
}

/// Build a hidden field for data forms.
pub fn build_field_hidden(var: &str, value: &str) -> Element {
    Element::builder("field", NS_DATA_FORMS)
        .attr("var", var)
        .attr("type", "hidden")
        .append(
            Element::builder("value", NS_DATA_FORMS)
                .append(value)
                .build(),
        )
        .build()
}

/// Build a text-single field for data forms.
pub fn build_field_text_single(var: &str, label: &str, value: &str) -> Element {
    Element::builder("field", NS_DATA_FORMS)
        .attr("var", var)
        .attr("type", "text-single")
        .attr("label", label)
        .append(
            Element::builder("value", NS_DATA_FORMS)
                .append(value)
                .build(),
        )
        .build()
}

/// Build a boolean field for data forms.
pub fn build_field_boolean(var: &str, label: &str, value: bool) -> Element {
    Element::builder("field", NS_DATA_FORMS)
        .attr("var", var)
        .attr("type", "boolean")
        .attr("label", label)
        .append(
            Element::builder("value", NS_DATA_FORMS)
                .append(if value { "1" } else { "0" })
                .build(),
        )
        .build()
}

/// Build a list-single field with its current value.
pub fn build_field_list_single(var: &str, label: &str, value: &str, options: &[&str]) -> Element {
    let mut builder = Element::builder("field", NS_DATA_FORMS)
        .attr("var", var)
        .attr("type", "list-single")
        .attr("label", label)
        .append(
            Element::builder("value", NS_DATA_FORMS)
                .append(value)
                .build(),
        );
    for option in options {
        builder = builder.append(
            Element::builder("option", NS_DATA_FORMS)
                .append(
                    Element::builder("value", NS_DATA_FORMS)
                        .append(*option)
                        .build(),
                )
                .build(),
        );
    }
    builder.build()
}

/// Build a list-multi (or jid-multi/text-multi) field with its values.
pub fn build_field_multi(var: &str, field_type: &str, label: &str, values: &[String]) -> Element {
    let mut builder = Element::builder("field", NS_DATA_FORMS)
        .attr("var", var)
        .attr("type", field_type)
        .attr("label", label);
    for value in values {
        builder = builder.append(
            Element::builder("value", NS_DATA_FORMS)
                .append(value.as_str())
                .build(),
        );
    }
    builder.build()
}

/// Expand a short-form node configuration into a submitted form.
///
/// The short form is a `configure` element carrying an `access`
/// attribute and optional `group` children naming allowed roster
/// groups. The expansion synthesizes FORM_TYPE, `pubsub#access_model`,
/// and `pubsub#roster_groups_allowed`.
pub fn expand_short_form(configure: &Element) -> Option<SubmittedForm> {
    let access = configure.attr("access")?;

    let mut form = SubmittedForm::default();
    form.set("FORM_TYPE", vec![FORM_TYPE_NODE_CONFIG.to_string()]);
    form.set("pubsub#access_model", vec![access.to_string()]);

    let groups: Vec<String> = configure
        .children()
        .filter(|c| c.name() == "group")
        .map(|g| g.text())
        .filter(|g| !g.is_empty())
        .collect();
    if !groups.is_empty() {
        form.set("pubsub#roster_groups_allowed", groups);
    }

    Some(form)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_boolean() {
        assert!(parse_boolean("1"));
        assert!(parse_boolean("true"));
        assert!(!parse_boolean("0"));
        assert!(!parse_boolean("false"));
        assert!(!parse_boolean("yes"));
    }

    #[test]
    fn test_parse_submitted_form() {
        let xml = r#"<x xmlns='jabber:x:data' type='submit'>
            <field var='FORM_TYPE' type='hidden'>
                <value>http://jabber.org/protocol/pubsub#node_config</value>
            </field>
            <field var='pubsub#access_model'><value>whitelist</value></field>
            <field var='pubsub#persist_items'><value>1</value></field>
            <field var='pubsub#roster_groups_allowed'>
                <value>friends</value>
                <value>family</value>
            </field>
        </x>"#;
        let elem: Element = xml.parse().expect("valid XML");
        let form = SubmittedForm::from_element(&elem).expect("submitted form");

        assert_eq!(form.form_type(), Some(FORM_TYPE_NODE_CONFIG));
        assert_eq!(form.value("pubsub#access_model"), Some("whitelist"));
        assert_eq!(form.bool_value("pubsub#persist_items"), Some(true));
        assert_eq!(form.values("pubsub#roster_groups_allowed").len(), 2);
        assert!(!form.has_field("pubsub#max_items"));
    }

    #[test]
    fn test_rejects_result_form() {
        let xml = r#"<x xmlns='jabber:x:data' type='result'/>"#;
        let elem: Element = xml.parse().expect("valid XML");
        assert!(SubmittedForm::from_element(&elem).is_none());
    }

    #[test]
    fn test_expand_short_form() {
        let xml = r#"<configure xmlns='http://jabber.org/protocol/pubsub' access='roster'>
            <group>friends</group>
            <group>colleagues</group>
        </configure>"#;
        let elem: Element = xml.parse().expect("valid XML");
        let form = expand_short_form(&elem).expect("short form");

        assert_eq!(form.form_type(), Some(FORM_TYPE_NODE_CONFIG));
        assert_eq!(form.value("pubsub#access_model"), Some("roster"));
        assert_eq!(
            form.values("pubsub#roster_groups_allowed"),
            &["friends".to_string(), "colleagues".to_string()]
        );
    }

    #[test]
    fn test_expand_short_form_requires_access_attr() {
        let xml = r#"<configure xmlns='http://jabber.org/protocol/pubsub'/>"#;
        let elem: Element = xml.parse().expect("valid XML");
        assert!(expand_short_form(&elem).is_none());
    }

    #[test]
    fn test_build_field_boolean() {
        let field = build_field_boolean("pubsub#deliver", "Deliver events", true);
        assert_eq!(field.attr("var"), Some("pubsub#deliver"));
        let value = field
            .children()
            .find(|c| c.name() == "value")
            .expect("value child");
        assert_eq!(value.text(), "1");
    }
}
