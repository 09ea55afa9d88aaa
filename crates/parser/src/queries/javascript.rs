//! JavaScript / JSX declaration query

pub const DECLARATIONS: &str = r#"
; Class methods
(method_definition
  name: (property_identifier) @name) @definition.method

; Classes
(class_declaration
  name: (identifier) @name) @definition.class

(class
  name: (identifier) @name) @definition.class

; Functions
(function_declaration
  name: (identifier) @name) @definition.function

(generator_function_declaration
  name: (identifier) @name) @definition.function

(function_expression
  name: (identifier) @name) @definition.function

; const f = () => {} / const f = function () {}
(variable_declarator
  name: (identifier) @name
  value: [(arrow_function) (function_expression)]) @definition.function
"#;
