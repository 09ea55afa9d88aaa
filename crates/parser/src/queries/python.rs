//! Python declaration query

pub const DECLARATIONS: &str = r#"
; Module-level assignments
(module
  (expression_statement
    (assignment
      left: (identifier) @name) @definition.variable))

; Classes
(class_definition
  name: (identifier) @name) @definition.class

; Functions (module-level, nested, and methods; the class-body pattern
; below reclassifies methods)
(function_definition
  name: (identifier) @name) @definition.function

; Methods
(class_definition
  body: (block
    (function_definition
      name: (identifier) @name) @definition.method))

; Decorated methods
(class_definition
  body: (block
    (decorated_definition
      definition: (function_definition
        name: (identifier) @name) @definition.method)))
"#;
