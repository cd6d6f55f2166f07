use calmform::form::{FieldLens, FormModel, FormTree, NodeSpec, TreeOptions};
use serde::{Deserialize, Serialize};

#[derive(Clone, Serialize, Deserialize, calmform::form::FormModel)]
pub struct DemoForm {
    email: String,
    age: u32,
}

fn main() {
    let fields = DemoForm::fields();
    assert_eq!(fields.email().key().as_str(), "email");
    assert_eq!(DemoForm::field_keys().len(), 2);

    let model = DemoForm {
        email: "a@calm.ui".to_string(),
        age: 30,
    };
    let spec = NodeSpec::from_model(&model).expect("model spec");
    let tree = FormTree::new(spec, TreeOptions::default());
    tree.set(fields.age(), 31).expect("set age");
    assert_eq!(tree.get(fields.age()).expect("get age"), 31);
    assert_eq!(tree.get(fields.email()).expect("get email"), "a@calm.ui");
}
