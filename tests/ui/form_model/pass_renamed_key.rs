use calmform::form::{FieldLens, FormModel};
use serde::{Deserialize, Serialize};

#[derive(Clone, Serialize, Deserialize, calmform::form::FormModel)]
#[serde(rename_all = "camelCase")]
pub struct PasswordForm {
    password: String,
    #[form(key = "confirmPassword")]
    confirm_password: String,
}

fn main() {
    let fields = PasswordForm::fields();
    assert_eq!(fields.password().key().as_str(), "password");
    assert_eq!(fields.confirm_password().key().as_str(), "confirmPassword");
    assert_eq!(
        PasswordForm::field_keys()
            .iter()
            .map(|key| key.as_str())
            .collect::<Vec<_>>(),
        vec!["password", "confirmPassword"]
    );
}
